use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::info;

use crate::compiler::{Compiler, OptimiserSettings, Solc};
use crate::constants::{
    DUMP_PATH_ENV_VAR, EVM_VERSION_ENV_VAR, EXPECTED_OUTPUT, LOAD_PATH_ENV_VAR, TEST_METHOD,
};
use crate::evm::{EvmHost, EvmVersion};
use crate::harness::{Failure, Harness, Verdict};
use crate::program::{Program, SOURCE_UNIT};
use crate::util::{load_source, resolve_solc_path};

/// Represents the global state for a fuzzing campaign.
///
/// This struct holds the EVM host every iteration runs on, the harness wiring
/// the compiler to it, and a name for the fuzzer, which is used to create
/// directories for artifacts like the input and crashes.
pub struct FuzzerState {
    name: String,
    /// The engine used to deploy and execute compiled contracts.
    /// It is an `Option` because it's created after the `FuzzerState` is built,
    /// by the orchestrator's `init`.
    host: Option<EvmHost>,
    harness: Harness,
}

/// Per-iteration settings of the harness.
#[derive(Debug, Clone, PartialEq)]
pub struct HarnessConfig {
    /// When set, generated source is written here before compilation.
    pub dump_path: Option<PathBuf>,
    /// When set, generated source is replaced by this file's contents.
    pub load_path: Option<PathBuf>,
    pub source_name: String,
    /// Compiler selector of the contract under test.
    pub contract: String,
    pub method: String,
    pub optimiser: OptimiserSettings,
    pub evm_version: Option<EvmVersion>,
    pub expected_output: Vec<u8>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            dump_path: None,
            load_path: None,
            source_name: SOURCE_UNIT.to_string(),
            contract: Program::contract_selector(),
            method: TEST_METHOD.to_string(),
            optimiser: OptimiserSettings::Minimal,
            evm_version: None,
            expected_output: EXPECTED_OUTPUT.to_vec(),
        }
    }
}

impl HarnessConfig {
    /// Reads the dump path, load path and EVM version from the environment.
    pub fn from_env() -> Result<Self> {
        let path = |var: &str| std::env::var_os(var).map(PathBuf::from);
        let evm_version = match std::env::var(EVM_VERSION_ENV_VAR) {
            Ok(version) => Some(
                version
                    .parse()
                    .with_context(|| format!("Invalid {EVM_VERSION_ENV_VAR}"))?,
            ),
            Err(_) => None,
        };
        Ok(Self {
            dump_path: path(DUMP_PATH_ENV_VAR),
            load_path: path(LOAD_PATH_ENV_VAR),
            evm_version,
            ..Self::default()
        })
    }

    /// Checks once, before any iteration, that the load file can be used.
    pub fn validate(&self) -> Result<()> {
        if let Some(path) = &self.load_path {
            load_source(path).with_context(|| format!("Unusable {LOAD_PATH_ENV_VAR}"))?;
        }
        Ok(())
    }
}

/// Specifies how to locate the compiler binary.
#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Clone)]
pub enum SolcPath {
    /// The path is stored in an environment variable.
    EnvVar(String),
    /// The path is a direct file path or a name looked up on `PATH`.
    Path(PathBuf),
}

/// A builder for creating `FuzzerState` instances.
pub struct FuzzerBuilder {
    name: String,
    compiler: Option<Box<dyn Compiler>>,
    solc: Option<SolcPath>,
    config: Option<HarnessConfig>,
}

impl Default for FuzzerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FuzzerBuilder {
    pub fn new() -> Self {
        Self {
            name: "solfuzz".to_string(),
            compiler: None,
            solc: None,
            config: None,
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Uses `solc` found at `path`.
    pub fn with_solc(mut self, path: SolcPath) -> Self {
        self.solc = Some(path);
        self
    }

    /// Uses an arbitrary compiler, taking precedence over [`Self::with_solc`].
    pub fn with_compiler(mut self, compiler: Box<dyn Compiler>) -> Self {
        self.compiler = Some(compiler);
        self
    }

    pub fn with_config(mut self, config: HarnessConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Builds the state. Without an explicit config, it is read from the environment.
    pub fn build(self) -> Result<FuzzerState> {
        let config = match self.config {
            Some(config) => config,
            None => HarnessConfig::from_env()?,
        };
        config.validate()?;
        let compiler = match self.compiler {
            Some(compiler) => compiler,
            None => {
                let path = resolve_solc_path(
                    self.solc
                        .unwrap_or_else(|| SolcPath::Path(PathBuf::from("solc"))),
                )?;
                let solc = Solc::new(path);
                let version = solc.version()?;
                info!(path = %solc.path().display(), %version, "Using compiler");
                Box::new(solc)
            }
        };
        Ok(FuzzerState::new(&self.name, Harness::new(compiler, config)))
    }
}

impl FuzzerState {
    pub fn new(name: &str, harness: Harness) -> Self {
        Self {
            name: name.to_string(),
            host: None,
            harness,
        }
    }

    /// Installs the engine every iteration runs on.
    pub fn init_state(&mut self, host: EvmHost) {
        self.host = Some(host);
    }

    /// Creates the engine for the configured EVM version.
    pub fn init_default_host(&mut self) {
        let host = EvmHost::for_evm_version(self.harness.config().evm_version);
        info!(spec = ?host.spec_id(), "EVM host ready");
        self.init_state(host);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// # Panics
    ///
    /// Panics if the engine has not been initialized via `init_state`.
    pub fn host_mut(&mut self) -> &mut EvmHost {
        self.host.as_mut().expect("EVM host is not initialized")
    }

    /// Decodes and runs one input on the engine.
    pub fn run_bytes(&mut self, data: &[u8]) -> Result<Verdict, Failure> {
        let host = self.host.as_mut().expect("EVM host is not initialized");
        self.harness.run_bytes(host, data)
    }
}
