//! The driver: one compile, deploy and execute round per fuzz input.
//!
//! ```text
//! Decode -> Compile -> (DeployLibrary) -> DeployContract -> ExecuteMethod -> Verify
//! ```
//!
//! Every failed precondition ends the iteration. Findings come back as
//! [`Failure`], everything else as a [`Verdict`].

use std::collections::BTreeMap;

use revm::primitives::{Address, HaltReason, MAX_INITCODE_SIZE, SpecId};
use tracing::{debug, warn};

use crate::compiler::{
    CompilationResult, CompileOutcome, CompileRequest, Compiler, CompilerFault,
};
use crate::evm::{EvmHost, StatusCode};
use crate::fuzzer::HarnessConfig;
use crate::program::Program;
use crate::util;

/// Why an iteration was dropped without a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscardReason {
    /// The compiler ran out of reachable stack slots.
    StackTooDeep,
    /// The fuzzer bytes did not decode into a program.
    Undecodable,
    /// The init or runtime code is over the engine's code size limit.
    CodeSizeLimit,
}

/// The non-failing results of an iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Deployed, executed and returned the expected output.
    Passed,
    Discarded(DiscardReason),
    /// The method finished with a non-success status other than revert.
    Ignored(StatusCode),
}

/// A finding: the compiled program did not behave the way its source says it must.
#[derive(Debug, thiserror::Error)]
pub enum Failure {
    #[error("Deploying library `{library}` failed with status {status}")]
    LibraryDeploymentFailed { library: String, status: StatusCode },
    #[error("Deploying `{contract}` failed with status {status}")]
    DeploymentFailed { contract: String, status: StatusCode },
    #[error("The compiler produced no bytecode for `{contract}`")]
    EmptyBytecode { contract: String },
    #[error("`{contract}` has no method `{method}`")]
    MissingSelector { contract: String, method: String },
    #[error("`{contract}` still carries unresolved library placeholders at {offsets:?}")]
    Unlinked { contract: String, offsets: Vec<usize> },
    #[error("`{method}` reverted with 0x{}", hex::encode(.output))]
    Reverted { method: String, output: Vec<u8> },
    #[error("Expected 0x{}, got 0x{}", hex::encode(.expected), hex::encode(.actual))]
    OutputMismatch { expected: Vec<u8>, actual: Vec<u8> },
    #[error(transparent)]
    CompilerFault(#[from] CompilerFault),
    #[error(transparent)]
    Harness(#[from] anyhow::Error),
}

impl Failure {
    /// Separates compiler faults from plain infrastructure errors.
    fn from_compiler_error(err: anyhow::Error) -> Self {
        match err.downcast::<CompilerFault>() {
            Ok(fault) => Failure::CompilerFault(fault),
            Err(err) => Failure::Harness(err),
        }
    }
}

pub fn is_output_expected(output: &[u8], expected: &[u8]) -> bool {
    output == expected
}

/// Wires a [`Compiler`] and an [`EvmHost`] together for every iteration.
pub struct Harness {
    compiler: Box<dyn Compiler>,
    config: HarnessConfig,
}

impl Harness {
    pub fn new(compiler: Box<dyn Compiler>, config: HarnessConfig) -> Self {
        Self { compiler, config }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Decodes `data` and runs the resulting program.
    pub fn run_bytes(&self, host: &mut EvmHost, data: &[u8]) -> Result<Verdict, Failure> {
        match Program::from_bytes(data) {
            Ok(program) => self.run_iteration(host, &program),
            Err(err) => {
                debug!(%err, "Input does not decode into a program");
                Ok(Verdict::Discarded(DiscardReason::Undecodable))
            }
        }
    }

    /// Compiles, deploys and executes `program` on `host`.
    pub fn run_iteration(&self, host: &mut EvmHost, program: &Program) -> Result<Verdict, Failure> {
        debug!(
            functions = program.functions.len(),
            nodes = program.node_count(),
            depth = program.depth(),
            library = program.library_test(),
            "Running program"
        );
        let source = self.prepare_source(program.to_solidity())?;
        self.compile_deploy_and_execute(host, &source, program.library_name())
    }

    /// Applies the dump and load paths to freshly generated source.
    ///
    /// A failed dump is logged and otherwise ignored.
    pub fn prepare_source(&self, source: String) -> Result<String, Failure> {
        if let Some(path) = &self.config.dump_path {
            if let Err(err) = util::dump_source(path, &source) {
                warn!(path = %path.display(), "{err:#}");
            }
        }
        match &self.config.load_path {
            Some(path) => {
                let loaded = util::load_source(path)?;
                println!("{loaded}");
                Ok(loaded)
            }
            None => Ok(source),
        }
    }

    /// Runs one source unit through the full pipeline.
    ///
    /// When `library` is set, that library is compiled and deployed first and
    /// its address is handed to the main compilation for linking.
    pub fn compile_deploy_and_execute(
        &self,
        host: &mut EvmHost,
        source: &str,
        library: Option<&str>,
    ) -> Result<Verdict, Failure> {
        let mut libraries = BTreeMap::new();
        if let Some(name) = library {
            let selector = format!("{}:{name}", self.config.source_name);
            let Some(compiled) = self.compile(source, &selector, &BTreeMap::new())? else {
                return Ok(Verdict::Discarded(DiscardReason::StackTooDeep));
            };
            let deployed = self
                .deploy(host, &selector, &compiled)
                .map_err(|failure| match failure {
                    Failure::DeploymentFailed { status, .. } => Failure::LibraryDeploymentFailed {
                        library: name.to_string(),
                        status,
                    },
                    other => other,
                })?;
            let Some(address) = deployed else {
                return Ok(Verdict::Discarded(DiscardReason::CodeSizeLimit));
            };
            debug!(library = name, %address, "Library deployed");
            libraries.insert(name.to_string(), address);
        }

        let contract = self.config.contract.clone();
        let Some(compiled) = self.compile(source, &contract, &libraries)? else {
            return Ok(Verdict::Discarded(DiscardReason::StackTooDeep));
        };
        if !libraries.is_empty() && !compiled.is_linked() {
            return Err(Failure::Unlinked {
                contract,
                offsets: compiled.unresolved_placeholders,
            });
        }
        let Some(address) = self.deploy(host, &contract, &compiled)? else {
            return Ok(Verdict::Discarded(DiscardReason::CodeSizeLimit));
        };

        let method = &self.config.method;
        let selector = compiled
            .selector(method)
            .ok_or_else(|| Failure::MissingSelector {
                contract: contract.clone(),
                method: method.clone(),
            })?;
        let outcome = host.execute(address, &selector.calldata(&[]))?;

        match outcome.status {
            StatusCode::Success => {
                if is_output_expected(&outcome.output, &self.config.expected_output) {
                    Ok(Verdict::Passed)
                } else {
                    Err(Failure::OutputMismatch {
                        expected: self.config.expected_output.clone(),
                        actual: outcome.output,
                    })
                }
            }
            StatusCode::Revert => Err(Failure::Reverted {
                method: method.clone(),
                output: outcome.output,
            }),
            status => {
                debug!(%status, "Ignoring non-revert failure status");
                Ok(Verdict::Ignored(status))
            }
        }
    }

    /// `None` when the compiler hit its stack limitation.
    fn compile(
        &self,
        source: &str,
        contract: &str,
        libraries: &BTreeMap<String, Address>,
    ) -> Result<Option<CompilationResult>, Failure> {
        let mut request = CompileRequest::new(&self.config.source_name, source, contract);
        request.libraries = libraries.clone();
        request.optimiser = self.config.optimiser;
        request.evm_version = self.config.evm_version;

        match self
            .compiler
            .compile(&request)
            .map_err(Failure::from_compiler_error)?
        {
            CompileOutcome::Compiled(result) => Ok(Some(result)),
            CompileOutcome::StackTooDeep => {
                debug!(contract, "Discarding input: stack too deep");
                Ok(None)
            }
        }
    }

    /// `None` when the init or runtime code is over the size limit.
    fn deploy(
        &self,
        host: &mut EvmHost,
        contract: &str,
        compiled: &CompilationResult,
    ) -> Result<Option<Address>, Failure> {
        if compiled.bytecode.is_empty() {
            return Err(Failure::EmptyBytecode {
                contract: contract.to_string(),
            });
        }
        // The engine rejects the whole transaction instead of halting.
        if SpecId::enabled(host.spec_id(), SpecId::SHANGHAI)
            && compiled.bytecode.len() > MAX_INITCODE_SIZE
        {
            debug!(
                contract,
                size = compiled.bytecode.len(),
                "Discarding input: init code too large"
            );
            return Ok(None);
        }
        let outcome = host.deploy(&compiled.bytecode)?;
        match (outcome.status, outcome.create_address) {
            (StatusCode::Success, Some(address)) => Ok(Some(address)),
            (StatusCode::Halt(HaltReason::CreateContractSizeLimit), _) => {
                debug!(contract, "Discarding input: runtime code too large");
                Ok(None)
            }
            (status, _) => Err(Failure::DeploymentFailed {
                contract: contract.to_string(),
                status,
            }),
        }
    }
}
