//! End-to-end runs against a real `solc`.
//!
//! These need a compiler, so they are ignored by default:
//!
//! ```text
//! SOLC_PATH=/path/to/solc cargo test -p solfuzz --test solc_pipeline -- --ignored
//! ```
//!
//! Without `SOLC_PATH`, `solc` is looked up on `PATH`. A missing compiler fails
//! the run instead of skipping it.

use assert_matches::assert_matches;
use solfuzz::compiler::{CompileOutcome, CompileRequest, Compiler, Solc};
use solfuzz::evm::{EvmHost, StatusCode};
use solfuzz::fuzzer::HarnessConfig;
use solfuzz::harness::{DiscardReason, Harness, Verdict};
use solfuzz::program::expr::{BinaryOp, Expr, Literal};
use solfuzz::program::{Function, Library, Program};

const TRIVIAL: &str = r#"
// SPDX-License-Identifier: GPL-3.0
pragma solidity >=0.8.0;
contract C {
    function test() public pure returns (uint256) { return 0; }
}
"#;

fn solc() -> Solc {
    let path = std::env::var_os("SOLC_PATH").unwrap_or_else(|| "solc".into());
    let solc = Solc::new(path);
    if let Err(err) = solc.version() {
        panic!("no usable solc, set SOLC_PATH: {err:#}");
    }
    solc
}

fn harness(solc: Solc) -> Harness {
    Harness::new(Box::new(solc), HarnessConfig::default())
}

#[test]
#[ignore = "needs a solc binary"]
fn trivial_contract_deploys_with_minimal_optimisation() {
    let solc = solc();
    let request = CompileRequest::new("fuzz.sol", TRIVIAL, "fuzz.sol:C");
    let compiled = match solc.compile(&request).unwrap() {
        CompileOutcome::Compiled(result) => result,
        CompileOutcome::StackTooDeep => panic!("trivial contract is not too deep"),
    };
    assert!(!compiled.bytecode.is_empty());
    assert!(compiled.selector("test()").is_some());

    let mut host = EvmHost::default();
    let deployed = host.deploy(&compiled.bytecode).unwrap();
    assert_eq!(deployed.status, StatusCode::Success);
}

#[test]
#[ignore = "needs a solc binary"]
fn trivial_contract_passes_the_harness() {
    let solc = solc();
    let mut host = EvmHost::default();
    let verdict = harness(solc).compile_deploy_and_execute(&mut host, TRIVIAL, None);
    assert_matches!(verdict, Ok(Verdict::Passed));
}

#[test]
#[ignore = "needs a solc binary"]
fn library_program_is_linked_and_passes() {
    let solc = solc();
    let program = Program {
        functions: vec![Function {
            body: Expr::Binary(
                BinaryOp::Div,
                Box::new(Expr::Literal(Literal::Max)),
                Box::new(Expr::Literal(Literal::Small(0))),
            ),
            through_storage: true,
        }],
        library: Some(Library {
            functions: vec![Expr::Binary(
                BinaryOp::Sub,
                Box::new(Expr::Literal(Literal::Small(1))),
                Box::new(Expr::Literal(Literal::Small(2))),
            )],
        }),
    };

    // Linking is checked inside the harness: an unresolved placeholder is a finding.
    let mut host = EvmHost::default();
    let verdict = harness(solc).run_iteration(&mut host, &program);
    assert_matches!(verdict, Ok(Verdict::Passed));
}

#[test]
#[ignore = "needs a solc binary"]
fn unlinked_library_call_leaves_a_placeholder() {
    let solc = solc();
    let program = Program {
        functions: vec![],
        library: Some(Library {
            functions: vec![Expr::Literal(Literal::Small(1))],
        }),
    };
    let request = CompileRequest::new("fuzz.sol", &program.to_solidity(), "fuzz.sol:C");
    let compiled = solc.compile(&request).unwrap().into_result();
    assert!(!compiled.is_linked());
    assert!(compiled.link_references.iter().any(|name| name == "L"));
}

#[test]
#[ignore = "needs a solc binary"]
fn generated_programs_pass_or_are_discarded() {
    let solc = solc();
    let harness = harness(solc);
    for seed in 0u8..16 {
        let data: Vec<u8> = (0..256u32)
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
            .collect();
        let mut host = EvmHost::default();
        let verdict = harness.run_bytes(&mut host, &data);
        assert_matches!(
            verdict,
            Ok(Verdict::Passed)
                | Ok(Verdict::Discarded(
                    DiscardReason::StackTooDeep | DiscardReason::CodeSizeLimit
                )),
            "seed {seed}"
        );
    }
}

#[test]
#[ignore = "needs a solc binary"]
fn seed_corpus_passes() {
    let harness = harness(solc());
    let corpus = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../fuzzers/sol_proto/corpus");
    for name in ["arith_pair", "deep_binary", "library_call"] {
        let data = std::fs::read(corpus.join(name)).unwrap();
        let mut host = EvmHost::default();
        assert_matches!(harness.run_bytes(&mut host, &data), Ok(Verdict::Passed), "{name}");
    }
}
