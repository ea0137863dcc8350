//! The input decoder: fuzzer bytes to a structured [`Program`] to Solidity source.
//!
//! A program is a contract `C` holding a handful of functions, each returning a
//! `uint256` expression, optionally accompanied by a library `L` whose external
//! functions `C` calls through `DELEGATECALL`. The expected value of every
//! function is computed here with wrapping 256-bit arithmetic and baked into
//! `C.test()`, which returns the 1-based index of the first function whose
//! compiled result disagrees, or 0 when all agree.

pub mod expr;

use std::fmt::Write;

use arbitrary::{Arbitrary, Unstructured};

pub use expr::{BinaryOp, Expr, Literal, MAX_PROGRAM_NODES, ShiftOp};

/// Source unit name every program is compiled under.
pub const SOURCE_UNIT: &str = "fuzz.sol";
pub const CONTRACT_NAME: &str = "C";
pub const LIBRARY_NAME: &str = "L";

pub const MAX_CONTRACT_FUNCTIONS: usize = 8;
pub const MAX_LIBRARY_FUNCTIONS: usize = 4;

/// One contract function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    pub body: Expr,
    /// Route the value through a state variable before returning it.
    pub through_storage: bool,
}

/// The optional external library.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Library {
    pub functions: Vec<Expr>,
}

impl<'a> Arbitrary<'a> for Library {
    fn arbitrary(u: &mut Unstructured<'a>) -> arbitrary::Result<Self> {
        let mut budget = MAX_PROGRAM_NODES;
        Self::arbitrary_with_budget(u, &mut budget)
    }
}

impl Library {
    fn arbitrary_with_budget(
        u: &mut Unstructured<'_>,
        budget: &mut usize,
    ) -> arbitrary::Result<Self> {
        let count = u.int_in_range(0..=MAX_LIBRARY_FUNCTIONS)?;
        let mut functions = Vec::with_capacity(count);
        for _ in 0..count {
            if *budget == 0 {
                break;
            }
            functions.push(Expr::arbitrary_with_budget(u, budget)?);
        }
        Ok(Library { functions })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Program {
    pub functions: Vec<Function>,
    pub library: Option<Library>,
}

/// Library and contract functions draw from one shared node budget of
/// [`MAX_PROGRAM_NODES`]; functions past the budget are not generated.
impl<'a> Arbitrary<'a> for Program {
    fn arbitrary(u: &mut Unstructured<'a>) -> arbitrary::Result<Self> {
        let mut budget = MAX_PROGRAM_NODES;
        let library = if bool::arbitrary(u)? {
            Some(Library::arbitrary_with_budget(u, &mut budget)?)
        } else {
            None
        };
        let count = u.int_in_range(0..=MAX_CONTRACT_FUNCTIONS)?;
        let mut functions = Vec::with_capacity(count);
        for _ in 0..count {
            if budget == 0 {
                break;
            }
            let body = Expr::arbitrary_with_budget(u, &mut budget)?;
            let through_storage = bool::arbitrary(u)?;
            functions.push(Function {
                body,
                through_storage,
            });
        }
        Ok(Program { functions, library })
    }
}

impl Program {
    /// Decodes a fuzzer input.
    pub fn from_bytes(data: &[u8]) -> arbitrary::Result<Self> {
        Program::arbitrary_take_rest(Unstructured::new(data))
    }

    /// Whether `C` calls into `L`, so `L` must be deployed and linked first.
    pub fn library_test(&self) -> bool {
        self.library
            .as_ref()
            .is_some_and(|library| !library.functions.is_empty())
    }

    /// The library to pre-deploy, when there is one.
    pub fn library_name(&self) -> Option<&'static str> {
        self.library_test().then_some(LIBRARY_NAME)
    }

    /// Expression nodes across all contract and library functions.
    pub fn node_count(&self) -> usize {
        self.bodies().map(Expr::node_count).sum()
    }

    /// Depth of the deepest function body.
    pub fn depth(&self) -> usize {
        self.bodies().map(Expr::depth).max().unwrap_or(0)
    }

    fn bodies(&self) -> impl Iterator<Item = &Expr> {
        self.functions
            .iter()
            .map(|function| &function.body)
            .chain(self.library.iter().flat_map(|library| library.functions.iter()))
    }

    /// The `file:Name` selector of the contract under test.
    pub fn contract_selector() -> String {
        format!("{SOURCE_UNIT}:{CONTRACT_NAME}")
    }

    /// Renders the program as a single Solidity source unit.
    pub fn to_solidity(&self) -> String {
        let mut out = String::new();
        out.push_str("// SPDX-License-Identifier: GPL-3.0\n");
        out.push_str("pragma solidity >=0.8.0;\n\n");

        if let Some(library) = &self.library {
            let _ = writeln!(out, "library {LIBRARY_NAME} {{");
            out.push_str(&expr::render_helpers("    "));
            for (index, body) in library.functions.iter().enumerate() {
                let _ = writeln!(
                    out,
                    "    function g{index}() external pure returns (uint256) {{\n        unchecked {{ return {}; }}\n    }}",
                    body.render()
                );
            }
            out.push_str("}\n\n");
        }

        let _ = writeln!(out, "contract {CONTRACT_NAME} {{");
        for (index, function) in self.functions.iter().enumerate() {
            if function.through_storage {
                let _ = writeln!(out, "    uint256 internal s{index};");
            }
        }
        out.push_str(&expr::render_helpers("    "));
        for (index, function) in self.functions.iter().enumerate() {
            let body = function.body.render();
            if function.through_storage {
                let _ = writeln!(
                    out,
                    "    function f{index}() public returns (uint256) {{\n        unchecked {{ s{index} = {body}; }}\n        return s{index};\n    }}"
                );
            } else {
                let _ = writeln!(
                    out,
                    "    function f{index}() public pure returns (uint256) {{\n        unchecked {{ return {body}; }}\n    }}"
                );
            }
        }

        out.push_str("    function test() public returns (uint256) {\n");
        for (check, (call, expected)) in self.checks().into_iter().enumerate() {
            let _ = writeln!(
                out,
                "        if ({call} != {}) return {};",
                Expr::literal(expected).render(),
                check + 1
            );
        }
        out.push_str("        return 0;\n    }\n}\n");
        out
    }

    /// `(call expression, expected value)` for every check `test()` performs, in order.
    pub fn checks(&self) -> Vec<(String, revm::primitives::U256)> {
        let contract = self
            .functions
            .iter()
            .enumerate()
            .map(|(index, function)| (format!("f{index}()"), function.body.evaluate()));
        let library = self
            .library
            .iter()
            .flat_map(|library| library.functions.iter().enumerate())
            .map(|(index, body)| (format!("{LIBRARY_NAME}.g{index}()"), body.evaluate()));
        contract.chain(library).collect()
    }
}
