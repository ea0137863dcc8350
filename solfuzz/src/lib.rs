//! A coverage-guided semantic fuzzing harness for the Solidity compiler.
//!
//! Each fuzz input is decoded into a small Solidity program whose result is
//! known in advance. The program is compiled with `solc`, deployed on an
//! in-process `revm` instance and its `test()` method is called; any output
//! other than the expected zero word is a miscompilation finding.
//! Campaigns are driven by `libafl`, with coverage taken from the EVM itself.
//!
//! ## Getting Started
//!
//! To create a fuzzer, implement the [`orchestrator::FuzzerOrchestrator`] trait.
//! Only the corpus directory is required; initialization, per-input setup and
//! execution have defaults that run the harness.
//!
//! ```no_run
//! use solfuzz::fuzzer::{FuzzerBuilder, FuzzerState, SolcPath};
//! use solfuzz::orchestrator::FuzzerOrchestrator;
//! use std::path::PathBuf;
//!
//! // 1. Define a struct for your fuzzer and derive FuzzerState.
//! // Note: Requires the "derive" feature enabled for solfuzz.
//! #[cfg_attr(feature = "derive", derive(solfuzz::FuzzerState))]
//! struct MyFuzzer(FuzzerState);
//!
//! // Manual implementation if "derive" feature is not used:
//! #[cfg(not(feature = "derive"))]
//! impl AsRef<FuzzerState> for MyFuzzer {
//!     fn as_ref(&self) -> &FuzzerState { &self.0 }
//! }
//! #[cfg(not(feature = "derive"))]
//! impl AsMut<FuzzerState> for MyFuzzer {
//!     fn as_mut(&mut self) -> &mut FuzzerState { &mut self.0 }
//! }
//!
//! // 2. Point the fuzzer at its seed inputs.
//! impl FuzzerOrchestrator for MyFuzzer {
//!     fn corpus_dir(&self) -> PathBuf {
//!         PathBuf::from("./corpus")
//!     }
//! }
//!
//! // 3. Set up and run the fuzzer.
//! fn main() -> anyhow::Result<()> {
//!     let state = FuzzerBuilder::new()
//!         .name("my_fuzzer")
//!         .with_solc(SolcPath::Path(PathBuf::from("solc")))
//!         .build()?;
//!
//!     let mut fuzzer = MyFuzzer(state);
//!     fuzzer.run()
//! }
//! ```
//!
//! For a complete fuzzer, see `fuzzers/sol_proto` in the project repository.
pub mod compiler;
pub mod evm;
pub mod fuzzer;
pub mod harness;
pub mod instrumentation;
pub mod orchestrator;
pub mod program;
pub mod util;

pub mod constants;

pub mod custom;

// re-export libAFL and libAFL_bolts
pub use libafl;
pub use libafl_bolts;

#[cfg(feature = "derive")]
pub use solfuzz_derive::FuzzerState;
