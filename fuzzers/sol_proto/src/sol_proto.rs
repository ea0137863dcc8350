//! Fuzzes `solc` with generated programs whose `test()` must return zero.
//!
//! ```text
//! sol_proto            run the campaign
//! sol_proto <input>    replay one input, aborting on a finding
//! ```

use std::path::PathBuf;

use anyhow::Context;
use solfuzz::FuzzerState;
use solfuzz::constants::SOLC_PATH_ENV_VAR;
use solfuzz::fuzzer::{FuzzerBuilder, SolcPath};
use solfuzz::orchestrator::FuzzerOrchestrator;
use solfuzz::util::read_input_file;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(FuzzerState)]
struct SolProtoFuzzer(solfuzz::fuzzer::FuzzerState);

impl FuzzerOrchestrator for SolProtoFuzzer {
    fn corpus_dir(&self) -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("corpus")
    }
}

/// Run-time `SOLC_PATH` first, then the binary found at build time, then `PATH`.
fn solc_path() -> SolcPath {
    if std::env::var_os(SOLC_PATH_ENV_VAR).is_some() {
        return SolcPath::EnvVar(SOLC_PATH_ENV_VAR.to_string());
    }
    match option_env!("SOLC_BINARY_PATH") {
        Some(path) => SolcPath::Path(PathBuf::from(path)),
        None => SolcPath::Path(PathBuf::from("solc")),
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let state = FuzzerBuilder::new()
        .name("sol_proto")
        .with_solc(solc_path())
        .build()
        .context("Failed to set up the fuzzer")?;
    let mut fuzzer = SolProtoFuzzer(state);

    match std::env::args_os().nth(1) {
        Some(input) => {
            let input = PathBuf::from(input);
            info!(input = %input.display(), "Replaying a single input");
            let bytes = read_input_file(&input)?;
            fuzzer.test_one_input(bytes);
            Ok(())
        }
        None => fuzzer.run(),
    }
}
