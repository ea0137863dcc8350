//! The execution engine: a `revm` instance with an in-memory world state.
//!
//! [`EvmHost`] is created once by the process bootstrap and handed by
//! reference to every iteration. Each interaction builds a fresh,
//! zero-initialised [`CallMessage`], runs it as a committed transaction and
//! returns an [`ExecutionOutcome`].

use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow, bail};
use revm::db::InMemoryDB;
use revm::primitives::{
    Address, Bytes, ExecutionResult, HaltReason, KECCAK_EMPTY, Output, SpecId, TransactTo, U256,
};
use revm::{Evm, inspector_handle_register};
use tracing::trace;

use crate::constants::MAX_GAS;
use crate::instrumentation::CoverageInspector;

/// The account every CREATE and CALL is sent from.
pub const DEFAULT_CALLER: Address = Address::new([0x10; 20]);

/// The kind of a VM interaction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    #[default]
    Call,
    Create,
}

/// A single message handed to the engine.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CallMessage {
    pub gas: u64,
    pub input: Bytes,
    /// Ignored for [`CallKind::Create`].
    pub destination: Address,
    pub kind: CallKind,
}

impl CallMessage {
    /// Zero-initialises every field, then sets the gas to its maximum and the input.
    pub fn new(input: impl Into<Bytes>) -> Self {
        Self {
            gas: MAX_GAS,
            input: input.into(),
            ..Default::default()
        }
    }

    pub fn create(code: impl Into<Bytes>) -> Self {
        Self {
            kind: CallKind::Create,
            ..Self::new(code)
        }
    }

    pub fn call(destination: Address, input: impl Into<Bytes>) -> Self {
        Self {
            destination,
            kind: CallKind::Call,
            ..Self::new(input)
        }
    }
}

/// The status an interaction finished with.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusCode {
    Success,
    Revert,
    /// Exceptional halt: out of gas, invalid opcode, stack errors, ...
    Halt(HaltReason),
}

impl StatusCode {
    pub fn is_success(&self) -> bool {
        matches!(self, StatusCode::Success)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusCode::Success => write!(f, "success"),
            StatusCode::Revert => write!(f, "revert"),
            StatusCode::Halt(reason) => write!(f, "halt ({reason:?})"),
        }
    }
}

/// What the engine returned for a [`CallMessage`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub status: StatusCode,
    pub output: Vec<u8>,
    /// Set for successful CREATE messages only.
    pub create_address: Option<Address>,
    pub gas_used: u64,
}

impl From<ExecutionResult> for ExecutionOutcome {
    fn from(result: ExecutionResult) -> Self {
        match result {
            ExecutionResult::Success {
                gas_used, output, ..
            } => {
                let (output, create_address) = match output {
                    Output::Call(out) => (out, None),
                    Output::Create(out, address) => (out, address),
                };
                ExecutionOutcome {
                    status: StatusCode::Success,
                    output: output.to_vec(),
                    create_address,
                    gas_used,
                }
            }
            ExecutionResult::Revert { gas_used, output } => ExecutionOutcome {
                status: StatusCode::Revert,
                output: output.to_vec(),
                create_address: None,
                gas_used,
            },
            ExecutionResult::Halt { reason, gas_used } => ExecutionOutcome {
                status: StatusCode::Halt(reason),
                output: vec![],
                create_address: None,
                gas_used,
            },
        }
    }
}

/// EVM versions understood by both the compiler and the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EvmVersion {
    Byzantium,
    Constantinople,
    Petersburg,
    Istanbul,
    Berlin,
    London,
    Paris,
    Shanghai,
    Cancun,
    Prague,
}

impl EvmVersion {
    /// The name `solc` uses in `settings.evmVersion`.
    pub fn as_str(&self) -> &'static str {
        match self {
            EvmVersion::Byzantium => "byzantium",
            EvmVersion::Constantinople => "constantinople",
            EvmVersion::Petersburg => "petersburg",
            EvmVersion::Istanbul => "istanbul",
            EvmVersion::Berlin => "berlin",
            EvmVersion::London => "london",
            EvmVersion::Paris => "paris",
            EvmVersion::Shanghai => "shanghai",
            EvmVersion::Cancun => "cancun",
            EvmVersion::Prague => "prague",
        }
    }

    pub fn spec_id(&self) -> SpecId {
        match self {
            EvmVersion::Byzantium => SpecId::BYZANTIUM,
            EvmVersion::Constantinople => SpecId::CONSTANTINOPLE,
            EvmVersion::Petersburg => SpecId::PETERSBURG,
            EvmVersion::Istanbul => SpecId::ISTANBUL,
            EvmVersion::Berlin => SpecId::BERLIN,
            EvmVersion::London => SpecId::LONDON,
            EvmVersion::Paris => SpecId::MERGE,
            EvmVersion::Shanghai => SpecId::SHANGHAI,
            EvmVersion::Cancun => SpecId::CANCUN,
            EvmVersion::Prague => SpecId::PRAGUE,
        }
    }
}

impl FromStr for EvmVersion {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "byzantium" => EvmVersion::Byzantium,
            "constantinople" => EvmVersion::Constantinople,
            "petersburg" => EvmVersion::Petersburg,
            "istanbul" => EvmVersion::Istanbul,
            "berlin" => EvmVersion::Berlin,
            "london" => EvmVersion::London,
            "paris" => EvmVersion::Paris,
            "shanghai" => EvmVersion::Shanghai,
            "cancun" => EvmVersion::Cancun,
            "prague" => EvmVersion::Prague,
            other => bail!("Unknown EVM version `{other}`"),
        })
    }
}

/// The engine used by every iteration.
///
/// The world state persists between the messages of one iteration (a library
/// deployed first is visible to the contract deployed after it) and is wiped
/// by [`EvmHost::reset`] before the next one.
pub struct EvmHost {
    db: InMemoryDB,
    spec_id: SpecId,
    caller: Address,
    coverage: CoverageInspector,
}

impl Default for EvmHost {
    fn default() -> Self {
        Self::new(SpecId::CANCUN)
    }
}

impl EvmHost {
    pub fn new(spec_id: SpecId) -> Self {
        Self {
            db: InMemoryDB::default(),
            spec_id,
            caller: DEFAULT_CALLER,
            coverage: CoverageInspector::new(),
        }
    }

    /// Creates a host matching the EVM version the compiler targets.
    /// `None` means the compiler's default, which the engine tracks as Cancun.
    pub fn for_evm_version(version: Option<EvmVersion>) -> Self {
        Self::new(version.map_or(SpecId::CANCUN, |v| v.spec_id()))
    }

    pub fn spec_id(&self) -> SpecId {
        self.spec_id
    }

    /// Runs `message` as a committed transaction.
    ///
    /// Only transactions the engine refuses to run at all produce an error;
    /// reverts and halts are reported through [`ExecutionOutcome::status`].
    pub fn call(&mut self, message: &CallMessage) -> Result<ExecutionOutcome> {
        let caller = self.caller;
        let mut evm = Evm::builder()
            .with_db(&mut self.db)
            .with_external_context(&mut self.coverage)
            .with_spec_id(self.spec_id)
            .modify_tx_env(|tx| {
                tx.caller = caller;
                tx.gas_limit = message.gas;
                tx.gas_price = U256::ZERO;
                tx.value = U256::ZERO;
                tx.data = message.input.clone();
                tx.transact_to = match message.kind {
                    CallKind::Create => TransactTo::Create,
                    CallKind::Call => TransactTo::Call(message.destination),
                };
            })
            .append_handler_register(inspector_handle_register)
            .build();

        let result = evm
            .transact_commit()
            .map_err(|e| anyhow!("EVM rejected the {:?} message: {e:?}", message.kind))?;
        let outcome = ExecutionOutcome::from(result);
        trace!(kind = ?message.kind, status = %outcome.status, gas_used = outcome.gas_used, "EVM message executed");
        Ok(outcome)
    }

    /// Installs `code` at a fresh address.
    pub fn deploy(&mut self, code: &[u8]) -> Result<ExecutionOutcome> {
        self.call(&CallMessage::create(Bytes::copy_from_slice(code)))
    }

    /// Calls the contract at `address` with `input` as calldata.
    pub fn execute(&mut self, address: Address, input: &[u8]) -> Result<ExecutionOutcome> {
        self.call(&CallMessage::call(address, Bytes::copy_from_slice(input)))
    }

    /// Whether `address` holds deployed code.
    pub fn has_code(&self, address: Address) -> bool {
        self.db
            .accounts
            .get(&address)
            .is_some_and(|account| account.info.code_hash != KECCAK_EMPTY)
    }

    /// Drops every account, returning the world state to genesis.
    pub fn reset(&mut self) {
        self.db = InMemoryDB::default();
    }

    pub fn coverage(&self) -> &CoverageInspector {
        &self.coverage
    }

    pub fn coverage_mut(&mut self) -> &mut CoverageInspector {
        &mut self.coverage
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use assert_matches::assert_matches;

    /// Runtime code returning one zero word: `PUSH1 0x20 PUSH1 0x00 RETURN`.
    pub(crate) const RETURN_ZERO_WORD: &[u8] = &[0x60, 0x20, 0x60, 0x00, 0xf3];
    /// Runtime code returning the word 1.
    pub(crate) const RETURN_ONE: &[u8] = &[
        0x60, 0x01, 0x60, 0x00, 0x52, 0x60, 0x20, 0x60, 0x00, 0xf3,
    ];
    /// Runtime code reverting with empty data: `PUSH1 0 PUSH1 0 REVERT`.
    pub(crate) const REVERT: &[u8] = &[0x60, 0x00, 0x60, 0x00, 0xfd];
    /// The designated invalid instruction.
    pub(crate) const INVALID: &[u8] = &[0xfe];

    /// Wraps runtime code in init code that copies and returns it.
    pub(crate) fn init_code(runtime: &[u8]) -> Vec<u8> {
        let len = u8::try_from(runtime.len()).unwrap();
        let mut code = vec![
            0x60, len, // PUSH1 len
            0x60, 0x0c, // PUSH1 offset of runtime
            0x60, 0x00, // PUSH1 0
            0x39, // CODECOPY
            0x60, len, // PUSH1 len
            0x60, 0x00, // PUSH1 0
            0xf3, // RETURN
        ];
        code.extend_from_slice(runtime);
        code
    }

    #[test]
    fn call_message_starts_zeroed_with_max_gas() {
        let message = CallMessage::new(Bytes::new());
        assert_eq!(message.gas, i64::MAX as u64);
        assert_eq!(message.destination, Address::ZERO);
        assert_eq!(message.kind, CallKind::Call);
        assert!(message.input.is_empty());
    }

    #[test]
    fn deploy_then_call_returns_runtime_output() {
        let mut host = EvmHost::default();
        let created = host.deploy(&init_code(RETURN_ZERO_WORD)).unwrap();
        assert_eq!(created.status, StatusCode::Success);
        let address = created.create_address.expect("CREATE must report an address");
        assert!(host.has_code(address));

        let called = host.execute(address, &[0xf8, 0xa8, 0xfd, 0x6d]).unwrap();
        assert_eq!(called.status, StatusCode::Success);
        assert_eq!(called.output, vec![0u8; 32]);
    }

    #[test]
    fn revert_and_halt_are_reported_as_statuses() {
        let mut host = EvmHost::default();
        let reverting = host.deploy(&init_code(REVERT)).unwrap();
        let address = reverting.create_address.unwrap();
        assert_eq!(host.execute(address, &[]).unwrap().status, StatusCode::Revert);

        let invalid = host.deploy(&init_code(INVALID)).unwrap();
        let address = invalid.create_address.unwrap();
        assert_matches!(host.execute(address, &[]).unwrap().status, StatusCode::Halt(_));
    }

    #[test]
    fn reverting_init_code_fails_the_create() {
        let mut host = EvmHost::default();
        let outcome = host.deploy(REVERT).unwrap();
        assert_eq!(outcome.status, StatusCode::Revert);
        assert_eq!(outcome.create_address, None);
    }

    #[test]
    fn reset_forgets_deployed_contracts() {
        let mut host = EvmHost::default();
        let address = host
            .deploy(&init_code(RETURN_ONE))
            .unwrap()
            .create_address
            .unwrap();
        host.reset();
        assert!(!host.has_code(address));

        // Same caller, same nonce: the next deployment lands on the same address.
        let again = host.deploy(&init_code(RETURN_ONE)).unwrap();
        assert_eq!(again.create_address, Some(address));
    }

    #[test]
    fn execution_is_traced_into_coverage() {
        let mut host = EvmHost::default();
        host.deploy(&init_code(RETURN_ZERO_WORD)).unwrap();
        assert!(host.coverage().edges() > 0);
        host.coverage_mut().reset();
        assert_eq!(host.coverage().edges(), 0);
    }

    #[test]
    fn evm_versions_parse_case_insensitively() {
        assert_eq!("Cancun".parse::<EvmVersion>().unwrap(), EvmVersion::Cancun);
        assert_eq!(" paris ".parse::<EvmVersion>().unwrap().spec_id(), SpecId::MERGE);
        assert!("frontier-classic".parse::<EvmVersion>().is_err());
    }
}
