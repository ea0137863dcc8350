//! Outcome novelty as a second feedback next to edge coverage.
//!
//! Every iteration ends in one [`OutcomeClass`]. The first input to reach a
//! class (the first stack-too-deep discard, the first out-of-gas halt, ...) is
//! kept in the corpus even when it adds no new EVM edges.

use std::borrow::Cow;
use std::cell::RefCell;

use libafl::feedbacks::{Feedback, StateInitializer};
use libafl::state::HasExecutions;
use libafl::{Error, HasNamedMetadata};
use libafl::{executors::ExitKind, observers::value::RefCellValueObserver};
use libafl_bolts::Named;
use libafl_bolts::tuples::{Handle, MatchName, MatchNameRef};
use revm::primitives::HaltReason;
use serde::{Deserialize, Serialize};

use crate::evm::StatusCode;
use crate::harness::{DiscardReason, Failure, Verdict};

/// First class index of the ignored statuses; see [`status_slot`].
const STATUS_BASE: u32 = 16;

/// The coarse result of one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutcomeClass(u32);

impl OutcomeClass {
    pub fn of(result: &Result<Verdict, Failure>) -> Self {
        let index = match result {
            Ok(Verdict::Passed) => 0,
            Ok(Verdict::Discarded(DiscardReason::StackTooDeep)) => 1,
            Ok(Verdict::Discarded(DiscardReason::Undecodable)) => 2,
            Ok(Verdict::Discarded(DiscardReason::CodeSizeLimit)) => 3,
            Ok(Verdict::Ignored(status)) => STATUS_BASE + status_slot(status),
            Err(failure) => {
                4 + match failure {
                    Failure::LibraryDeploymentFailed { .. } => 0,
                    Failure::DeploymentFailed { .. } => 1,
                    Failure::EmptyBytecode { .. } => 2,
                    Failure::MissingSelector { .. } => 3,
                    Failure::Unlinked { .. } => 4,
                    Failure::Reverted { .. } => 5,
                    Failure::OutputMismatch { .. } => 6,
                    Failure::CompilerFault(_) => 7,
                    Failure::Harness(_) => 8,
                }
            }
        };
        OutcomeClass(index)
    }

    pub fn index(&self) -> u32 {
        self.0
    }
}

/// One slot per halt kind, ignoring the payload some kinds carry.
fn status_slot(status: &StatusCode) -> u32 {
    let reason = match status {
        StatusCode::Success => return 0,
        StatusCode::Revert => return 1,
        StatusCode::Halt(reason) => reason,
    };
    match reason {
        HaltReason::OutOfGas(_) => 2,
        HaltReason::OpcodeNotFound => 3,
        HaltReason::InvalidFEOpcode => 4,
        HaltReason::InvalidJump => 5,
        HaltReason::NotActivated => 6,
        HaltReason::StackUnderflow => 7,
        HaltReason::StackOverflow => 8,
        HaltReason::OutOfOffset => 9,
        HaltReason::CreateCollision => 10,
        HaltReason::PrecompileError => 11,
        HaltReason::NonceOverflow => 12,
        HaltReason::CreateContractSizeLimit => 13,
        HaltReason::CreateContractStartingWithEF => 14,
        HaltReason::CreateInitCodeSizeLimit => 15,
        HaltReason::OverflowPayment => 16,
        HaltReason::StateChangeDuringStaticCall => 17,
        HaltReason::CallNotAllowedInsideStatic => 18,
        HaltReason::OutOfFunds => 19,
        HaltReason::CallTooDeep => 20,
        _ => 21,
    }
}

// Struct to store the outcome classes seen so far
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeMap {
    pub seen: u64,
    /// Whether the last recorded outcome was new.
    pub novel: bool,
}

impl OutcomeMap {
    pub fn record(&mut self, class: OutcomeClass) {
        let bit = 1u64 << class.index();
        self.novel = self.seen & bit == 0;
        self.seen |= bit;
    }
}

// Store
pub static mut OUTCOMES: RefCell<OutcomeMap> = RefCell::new(OutcomeMap {
    seen: 0u64,
    novel: false,
});

/// Records the outcome of the iteration that just finished.
pub fn record_outcome(result: &Result<Verdict, Failure>) {
    let class = OutcomeClass::of(result);
    // SAFETY: the harness is single-threaded and the observer only reads the
    // cell after the iteration returns.
    let outcomes = unsafe { &*(&raw const OUTCOMES) };
    outcomes.borrow_mut().record(class);
}

// Observer
pub type OutcomeMapObserver<'a> = RefCellValueObserver<'a, OutcomeMap>;
pub const OUTCOME_MAP_OBSERVER_NAME: &str = "OutcomeMapObserver";

// Feedback
#[derive(Serialize, Clone, Debug)]
pub struct OutcomeMapFeedback<'a> {
    handle: Handle<OutcomeMapObserver<'a>>,
}

impl OutcomeMapFeedback<'_> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            handle: Handle::new(Cow::Borrowed(OUTCOME_MAP_OBSERVER_NAME)),
        }
    }
}

impl Default for OutcomeMapFeedback<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl Named for OutcomeMapFeedback<'_> {
    #[inline]
    fn name(&self) -> &Cow<'static, str> {
        self.handle.name()
    }
}

impl<S> StateInitializer<S> for OutcomeMapFeedback<'_> {
    fn init_state(&mut self, _state: &mut S) -> Result<(), Error> {
        Ok(())
    }
}

impl<EM, I, OT, S> Feedback<EM, I, OT, S> for OutcomeMapFeedback<'_>
where
    S: HasNamedMetadata + HasExecutions,
    OT: MatchName,
{
    #[allow(clippy::wrong_self_convention)]
    fn is_interesting(
        &mut self,
        _state: &mut S,
        _manager: &mut EM,
        _input: &I,
        observers: &OT,
        _exit_kind: &ExitKind,
    ) -> Result<bool, Error> {
        let observer: &OutcomeMapObserver = observers
            .get(&self.handle)
            .ok_or_else(|| Error::key_not_found(OUTCOME_MAP_OBSERVER_NAME))?;
        Ok(observer.get_ref().novel)
    }

    fn append_metadata(
        &mut self,
        _state: &mut S,
        _manager: &mut EM,
        _observers: &OT,
        _testcase: &mut libafl::corpus::Testcase<I>,
    ) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use revm::primitives::OutOfGasError;

    #[test]
    fn only_the_first_occurrence_is_novel() {
        let mut map = OutcomeMap::default();
        let passed = OutcomeClass::of(&Ok(Verdict::Passed));
        let deep = OutcomeClass::of(&Ok(Verdict::Discarded(DiscardReason::StackTooDeep)));

        map.record(passed);
        assert!(map.novel);
        map.record(passed);
        assert!(!map.novel);
        map.record(deep);
        assert!(map.novel);
        assert_eq!(map.seen.count_ones(), 2);
    }

    #[test]
    fn classes_fit_the_map_and_separate_findings() {
        let results = [
            Ok(Verdict::Passed),
            Ok(Verdict::Discarded(DiscardReason::Undecodable)),
            Ok(Verdict::Discarded(DiscardReason::CodeSizeLimit)),
            Ok(Verdict::Ignored(StatusCode::Halt(HaltReason::OutOfGas(
                OutOfGasError::Basic,
            )))),
            Err(Failure::Reverted {
                method: "test()".to_string(),
                output: vec![],
            }),
            Err(Failure::Harness(anyhow::anyhow!("engine"))),
        ];
        let classes: Vec<_> = results.iter().map(OutcomeClass::of).collect();
        for class in &classes {
            assert!(class.index() < 64);
        }
        for (i, a) in classes.iter().enumerate() {
            for b in &classes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn halts_are_grouped_by_kind() {
        let basic = StatusCode::Halt(HaltReason::OutOfGas(OutOfGasError::Basic));
        let memory = StatusCode::Halt(HaltReason::OutOfGas(OutOfGasError::Memory));
        assert_eq!(
            OutcomeClass::of(&Ok(Verdict::Ignored(basic))),
            OutcomeClass::of(&Ok(Verdict::Ignored(memory)))
        );
    }

    #[test]
    fn distinct_halt_kinds_get_distinct_classes() {
        let halts = [
            HaltReason::OutOfGas(OutOfGasError::Basic),
            HaltReason::OpcodeNotFound,
            HaltReason::InvalidFEOpcode,
            HaltReason::InvalidJump,
            HaltReason::StackUnderflow,
            HaltReason::StackOverflow,
            HaltReason::OutOfOffset,
            HaltReason::CallTooDeep,
        ];
        let classes: Vec<_> = halts
            .into_iter()
            .map(|reason| OutcomeClass::of(&Ok(Verdict::Ignored(StatusCode::Halt(reason)))))
            .collect();
        for (i, a) in classes.iter().enumerate() {
            assert!(a.index() < 64);
            for b in &classes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
