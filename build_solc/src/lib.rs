use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

#[derive(Debug)]
pub struct SolcLookupOpts<'a> {
    /// Name of the compiler binary looked up on `PATH`.
    pub binary: &'a str,
    /// Build-time variable that points at the binary directly.
    pub override_var: &'a str,
    /// Variable exported to the crate through `cargo:rustc-env`.
    pub env_var: &'a str,
}

impl Default for SolcLookupOpts<'_> {
    fn default() -> Self {
        Self {
            binary: "solc",
            override_var: "SOLC_PATH",
            env_var: "SOLC_BINARY_PATH",
        }
    }
}

/// Finds a working compiler and exports its path to the crate being built.
///
/// A missing compiler is not fatal: the fuzzer can still be pointed at one at
/// run time, so only a warning is printed.
pub fn locate_solc(opts: SolcLookupOpts) {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed={}", opts.override_var);
    println!("cargo:rerun-if-env-changed=PATH");

    let candidate = match env::var_os(opts.override_var) {
        Some(path) => Some(PathBuf::from(path)),
        None => find_on_path(opts.binary),
    };

    match candidate {
        Some(path) if reports_version(&path) => {
            println!("cargo:rustc-env={}={}", opts.env_var, path.display());
        }
        Some(path) => println!(
            "cargo:warning={} does not run; set {} at run time",
            path.display(),
            opts.override_var
        ),
        None => println!(
            "cargo:warning=No `{}` found on PATH; set {} at build or run time",
            opts.binary, opts.override_var
        ),
    }
}

fn find_on_path(binary: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}

/// Whether `path --version` succeeds and prints a `Version:` line.
fn reports_version(path: &Path) -> bool {
    Command::new(path)
        .arg("--version")
        .output()
        .is_ok_and(|output| {
            output.status.success()
                && String::from_utf8_lossy(&output.stdout)
                    .lines()
                    .any(|line| line.starts_with("Version"))
        })
}
