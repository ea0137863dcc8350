//! The campaign loop: a `libafl` in-process fuzzer around the harness.
//!
//! Implementors only name a corpus directory; every other step has a default
//! that runs [`crate::harness::Harness`] on the state's EVM host.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use libafl::{
    Evaluator,
    corpus::{Corpus, inmemory_ondisk::InMemoryOnDiskCorpus},
    events::SimpleEventManager,
    executors::{ExitKind, inprocess::InProcessExecutor},
    feedback_or,
    feedbacks::{CrashFeedback, map::AflMapFeedback},
    fuzzer::{Fuzzer, StdFuzzer},
    inputs::BytesInput,
    monitors::SimpleMonitor,
    mutators::{HavocScheduledMutator, havoc_mutations},
    observers::{
        RefCellValueObserver,
        map::{StdMapObserver, hitcount_map::HitcountsMapObserver},
    },
    schedulers::QueueScheduler,
    stages::{AflStatsStage, CalibrationStage, mutational::StdMutationalStage},
    state::{HasCorpus, StdState},
};
use libafl_bolts::{current_nanos, ownedref::OwnedRef, rands::StdRand, tuples::tuple_list};
use tracing::{error, info};

use crate::custom::outcome_map::{
    OUTCOME_MAP_OBSERVER_NAME, OUTCOMES, OutcomeMapFeedback, record_outcome,
};
use crate::fuzzer::FuzzerState;
use crate::harness::{Failure, Verdict};
use crate::instrumentation::coverage_map;
use crate::util::{exit_kind_for, read_input_file};

/// Size of the seed used when the corpus directory holds no inputs.
const FALLBACK_SEED_LEN: usize = 64;

pub trait FuzzerOrchestrator: AsRef<FuzzerState> + AsMut<FuzzerState> {
    /// Creates the EVM host.
    fn init(&mut self) {
        self.as_mut().init_default_host();
    }

    /// Returns the world state to genesis before each input.
    fn setup(&mut self) {
        self.as_mut().host_mut().reset();
    }

    fn execute(&mut self, input: BytesInput) -> ExitKind {
        let bytes: Vec<u8> = input.into();
        let result = self.as_mut().run_bytes(&bytes);
        if let Err(failure) = &result {
            error!(%failure, "Finding");
        }
        record_outcome(&result);
        exit_kind_for(&result)
    }

    fn cleanup(&mut self) {}

    /// Directory with seed inputs. It may be missing.
    fn corpus_dir(&self) -> PathBuf;

    fn input_dir(&self) -> PathBuf {
        PathBuf::from(self.as_ref().name()).join("input")
    }

    fn crashes_dir(&self) -> PathBuf {
        PathBuf::from(self.as_ref().name()).join("crashes")
    }

    /// Moves the last execution's coverage into the observed map.
    fn set_coverage_map(&mut self) {
        let map = unsafe { coverage_map() };
        self.as_mut().host_mut().coverage_mut().flush_into(map);
    }

    /// Runs the campaign until the process is stopped.
    fn run(&mut self) -> Result<()> {
        self.init();

        let input_dir = self.input_dir();
        let crashes_dir = self.crashes_dir();
        let corpus_dir = self.corpus_dir();

        let mut harness = |input: &BytesInput| {
            self.setup();
            let result = self.execute(input.clone());
            self.set_coverage_map();
            self.cleanup();
            result
        };

        let outcome_map_observer = unsafe {
            RefCellValueObserver::new(
                OUTCOME_MAP_OBSERVER_NAME,
                OwnedRef::from_ptr(&raw const OUTCOMES),
            )
        };
        let hitcount_map_observer = HitcountsMapObserver::new(unsafe {
            StdMapObserver::new("coverage_map", coverage_map())
        });

        let afl_map_feedback = AflMapFeedback::new(&hitcount_map_observer);
        let calibration_stage = CalibrationStage::new(&afl_map_feedback);
        let stats_stage = AflStatsStage::builder()
            .map_feedback(&afl_map_feedback)
            .build()?;

        let mut feedback = feedback_or!(OutcomeMapFeedback::new(), afl_map_feedback);
        let mut objective = CrashFeedback::new();

        let mut state = StdState::new(
            StdRand::with_seed(current_nanos()),
            InMemoryOnDiskCorpus::no_meta(input_dir)?,
            InMemoryOnDiskCorpus::no_meta(crashes_dir)?,
            &mut feedback,
            &mut objective,
        )?;

        let mon = SimpleMonitor::new(|s| println!("{s}"));
        let mut mgr = SimpleEventManager::new(mon);
        let scheduler = QueueScheduler::new();
        let mut fuzzer = StdFuzzer::new(scheduler, feedback, objective);

        let mut executor = InProcessExecutor::new(
            &mut harness,
            tuple_list!(hitcount_map_observer, outcome_map_observer),
            &mut fuzzer,
            &mut state,
            &mut mgr,
        )?;

        if corpus_dir.is_dir() {
            for entry in fs::read_dir(&corpus_dir)
                .with_context(|| format!("Failed to list {}", corpus_dir.display()))?
            {
                let path = entry?.path();
                if !path.is_file() {
                    continue;
                }
                let buffer = read_input_file(&path)?;
                fuzzer.evaluate_input(
                    &mut state,
                    &mut executor,
                    &mut mgr,
                    &BytesInput::new(buffer),
                )?;
            }
        }
        if state.corpus().count() == 0 {
            info!("Seeding an empty corpus with a zero input");
            fuzzer.add_input(
                &mut state,
                &mut executor,
                &mut mgr,
                BytesInput::new(vec![0; FALLBACK_SEED_LEN]),
            )?;
        }

        let mutator = HavocScheduledMutator::new(havoc_mutations());
        let mut stages = tuple_list!(
            calibration_stage,
            StdMutationalStage::new(mutator),
            stats_stage
        );
        fuzzer.fuzz_loop(&mut stages, &mut executor, &mut state, &mut mgr)?;
        Ok(())
    }

    /// Runs a single input on a fresh host.
    fn replay(&mut self, bytes: &[u8]) -> Result<Verdict, Failure> {
        self.init();
        self.setup();
        let result = self.as_mut().run_bytes(bytes);
        self.cleanup();
        result
    }

    /// Replays `bytes` and aborts the process on a finding.
    fn test_one_input(&mut self, bytes: Vec<u8>) {
        match self.replay(&bytes) {
            Ok(verdict) => println!("Execution result: {verdict:?}"),
            Err(failure) => {
                error!(%failure, "Finding");
                eprintln!("Execution result: {failure}");
                std::process::abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{CompileOutcome, CompileRequest, Compiler};
    use crate::fuzzer::{FuzzerBuilder, HarnessConfig};
    use crate::harness::DiscardReason;
    use assert_matches::assert_matches;

    struct TooDeep;

    impl Compiler for TooDeep {
        fn compile(&self, _: &CompileRequest) -> anyhow::Result<CompileOutcome> {
            Ok(CompileOutcome::StackTooDeep)
        }
    }

    struct TestFuzzer(FuzzerState);

    impl AsRef<FuzzerState> for TestFuzzer {
        fn as_ref(&self) -> &FuzzerState {
            &self.0
        }
    }

    impl AsMut<FuzzerState> for TestFuzzer {
        fn as_mut(&mut self) -> &mut FuzzerState {
            &mut self.0
        }
    }

    impl FuzzerOrchestrator for TestFuzzer {
        fn corpus_dir(&self) -> PathBuf {
            PathBuf::from("corpus")
        }
    }

    fn fuzzer() -> TestFuzzer {
        let state = FuzzerBuilder::new()
            .name("orchestrator_test")
            .with_compiler(Box::new(TooDeep))
            .with_config(HarnessConfig::default())
            .build()
            .unwrap();
        TestFuzzer(state)
    }

    #[test]
    fn artifact_dirs_live_under_the_fuzzer_name() {
        let fuzzer = fuzzer();
        assert_eq!(fuzzer.input_dir(), PathBuf::from("orchestrator_test/input"));
        assert_eq!(fuzzer.crashes_dir(), PathBuf::from("orchestrator_test/crashes"));
    }

    #[test]
    fn replay_runs_one_iteration() {
        let mut fuzzer = fuzzer();
        assert_matches!(
            fuzzer.replay(&[1, 2, 3]),
            Ok(Verdict::Discarded(DiscardReason::StackTooDeep))
        );
    }

    #[test]
    fn execute_reports_discards_as_ok() {
        let mut fuzzer = fuzzer();
        fuzzer.init();
        fuzzer.setup();
        assert_eq!(fuzzer.execute(BytesInput::new(vec![7; 16])), ExitKind::Ok);
        fuzzer.cleanup();
    }
}
