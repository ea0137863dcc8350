use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::fuzzer::SolcPath;
use crate::harness::{Failure, Verdict};
use crate::libafl::executors::ExitKind;

pub fn resolve_solc_path(solc_path: SolcPath) -> Result<PathBuf> {
    match solc_path {
        SolcPath::EnvVar(env_var) => std::env::var_os(&env_var)
            .map(PathBuf::from)
            .with_context(|| format!("{env_var} is not set")),
        SolcPath::Path(path) => Ok(path),
    }
}

/// Writes `source` to `path`, replacing any previous contents.
pub fn dump_source(path: &Path, source: &str) -> Result<()> {
    fs::write(path, source).with_context(|| format!("Failed to dump source to {}", path.display()))
}

/// Reads source to compile in place of the generated one. It must be UTF-8.
pub fn load_source(path: &Path) -> Result<String> {
    let bytes =
        fs::read(path).with_context(|| format!("Failed to load source from {}", path.display()))?;
    String::from_utf8(bytes)
        .with_context(|| format!("Source in {} is not valid UTF-8", path.display()))
}

pub fn read_input_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("Failed to read input {}", path.display()))
}

/// Findings are crashes for the fuzzing engine; everything else is a normal run.
pub fn exit_kind_for(result: &Result<Verdict, Failure>) -> ExitKind {
    match result {
        Ok(_) => ExitKind::Ok,
        Err(_) => ExitKind::Crash,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::DiscardReason;

    #[test]
    fn findings_are_crashes() {
        assert_eq!(exit_kind_for(&Ok(Verdict::Passed)), ExitKind::Ok);
        assert_eq!(
            exit_kind_for(&Ok(Verdict::Discarded(DiscardReason::StackTooDeep))),
            ExitKind::Ok
        );
        let failure = Failure::OutputMismatch {
            expected: vec![0; 32],
            actual: vec![1; 32],
        };
        assert_eq!(exit_kind_for(&Err(failure)), ExitKind::Crash);
    }

    #[test]
    fn solc_path_resolution() {
        let direct = resolve_solc_path(SolcPath::Path(PathBuf::from("/opt/solc"))).unwrap();
        assert_eq!(direct, PathBuf::from("/opt/solc"));
        assert!(resolve_solc_path(SolcPath::EnvVar("SOLFUZZ_UNSET_FOR_TESTS".into())).is_err());
    }

    #[test]
    fn dump_overwrites_and_load_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fuzz.sol");
        dump_source(&path, "a much longer first version").unwrap();
        dump_source(&path, "short").unwrap();
        assert_eq!(load_source(&path).unwrap(), "short");
        assert_eq!(read_input_file(&path).unwrap(), b"short");
        assert!(load_source(&dir.path().join("missing.sol")).is_err());

        std::fs::write(&path, b"contract \xff {}").unwrap();
        let err = load_source(&path).unwrap_err();
        assert!(err.to_string().contains("not valid UTF-8"));
    }
}
