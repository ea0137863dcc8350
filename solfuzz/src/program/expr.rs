//! `uint256` expressions: generation, evaluation and Solidity rendering.
//!
//! Every expression is rendered inside an `unchecked` block, so arithmetic
//! wraps modulo 2^256 in the compiled code exactly as it does in
//! [`Expr::evaluate`]. Division and modulo by zero go through helpers that
//! return zero instead of panicking.

use arbitrary::{Arbitrary, Unstructured};
use revm::primitives::U256;

/// Nodes deeper than this are always literals.
pub const MAX_EXPR_DEPTH: usize = 6;

/// Nodes one program may hold across all of its contract and library functions.
///
/// Keeps the compiled contract well under the EVM code size limits.
pub const MAX_PROGRAM_NODES: usize = 256;

/// Exponents stay small so `**` does not dominate the generated code.
pub const MAX_EXPONENT: u8 = 16;

/// Name of the zero-safe division helper emitted into every contract and library.
pub const DIV_HELPER: &str = "div_";
/// Name of the zero-safe modulo helper emitted into every contract and library.
pub const MOD_HELPER: &str = "mod_";

#[derive(Arbitrary, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Literal {
    Small(u8),
    Max,
    Word([u8; 32]),
}

impl Literal {
    pub fn value(&self) -> U256 {
        match self {
            Literal::Small(n) => U256::from(*n),
            Literal::Max => U256::MAX,
            Literal::Word(bytes) => U256::from_be_bytes(*bytes),
        }
    }

    /// Always typed as `uint256`, so literal-only subtrees are not folded as rationals.
    pub fn render(&self) -> String {
        match self {
            Literal::Small(n) => format!("uint256({n})"),
            Literal::Max => "type(uint256).max".to_string(),
            Literal::Word(bytes) => format!("uint256(0x{})", hex::encode(bytes)),
        }
    }
}

#[derive(Arbitrary, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    And,
    Or,
    Xor,
}

impl BinaryOp {
    pub fn apply(&self, lhs: U256, rhs: U256) -> U256 {
        match self {
            BinaryOp::Add => lhs.wrapping_add(rhs),
            BinaryOp::Sub => lhs.wrapping_sub(rhs),
            BinaryOp::Mul => lhs.wrapping_mul(rhs),
            BinaryOp::Div => lhs.checked_div(rhs).unwrap_or(U256::ZERO),
            BinaryOp::Mod => lhs.checked_rem(rhs).unwrap_or(U256::ZERO),
            BinaryOp::And => lhs & rhs,
            BinaryOp::Or => lhs | rhs,
            BinaryOp::Xor => lhs ^ rhs,
        }
    }

    fn render(&self, lhs: &str, rhs: &str) -> String {
        let op = match self {
            BinaryOp::Div => return format!("{DIV_HELPER}({lhs}, {rhs})"),
            BinaryOp::Mod => return format!("{MOD_HELPER}({lhs}, {rhs})"),
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::And => "&",
            BinaryOp::Or => "|",
            BinaryOp::Xor => "^",
        };
        format!("({lhs} {op} {rhs})")
    }
}

#[derive(Arbitrary, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftOp {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Literal(Literal),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Shift(ShiftOp, Box<Expr>, u8),
    Exp(Box<Expr>, u8),
    /// `lhs < rhs ? then : otherwise`
    Select {
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
}

impl<'a> Arbitrary<'a> for Expr {
    fn arbitrary(u: &mut Unstructured<'a>) -> arbitrary::Result<Self> {
        let mut budget = MAX_PROGRAM_NODES;
        Self::arbitrary_with_budget(u, &mut budget)
    }
}

impl Expr {
    /// Generates one expression drawing its nodes from `budget`.
    ///
    /// The expression never holds more nodes than `budget` had on entry (but at
    /// least one), and the nodes it holds are subtracted from it.
    pub fn arbitrary_with_budget(
        u: &mut Unstructured<'_>,
        budget: &mut usize,
    ) -> arbitrary::Result<Self> {
        Self::arbitrary_at(u, 0, budget)
    }

    /// Depth- and size-bounded generation; the derive would recurse as deep as the input allows.
    fn arbitrary_at(
        u: &mut Unstructured<'_>,
        depth: usize,
        budget: &mut usize,
    ) -> arbitrary::Result<Self> {
        if depth >= MAX_EXPR_DEPTH || u.is_empty() || *budget < 2 {
            return Self::leaf(u, budget);
        }
        let choice = u.int_in_range(0u8..=5)?;
        let children = match choice {
            0 => return Self::leaf(u, budget),
            1 => 2,
            2..=4 => 1,
            _ => 4,
        };
        if *budget < 1 + children {
            return Self::leaf(u, budget);
        }
        // One slot is held back per child so every child can at least be a literal.
        *budget -= 1 + children;
        Ok(match choice {
            1 => {
                let op = BinaryOp::arbitrary(u)?;
                Expr::Binary(op, Self::child(u, depth, budget)?, Self::child(u, depth, budget)?)
            }
            2 => Expr::Not(Self::child(u, depth, budget)?),
            3 => {
                let op = ShiftOp::arbitrary(u)?;
                Expr::Shift(op, Self::child(u, depth, budget)?, u8::arbitrary(u)?)
            }
            4 => Expr::Exp(Self::child(u, depth, budget)?, u.int_in_range(0..=MAX_EXPONENT)?),
            _ => Expr::Select {
                lhs: Self::child(u, depth, budget)?,
                rhs: Self::child(u, depth, budget)?,
                then: Self::child(u, depth, budget)?,
                otherwise: Self::child(u, depth, budget)?,
            },
        })
    }

    fn child(
        u: &mut Unstructured<'_>,
        depth: usize,
        budget: &mut usize,
    ) -> arbitrary::Result<Box<Self>> {
        *budget += 1;
        Self::arbitrary_at(u, depth + 1, budget).map(Box::new)
    }

    fn leaf(u: &mut Unstructured<'_>, budget: &mut usize) -> arbitrary::Result<Self> {
        *budget = budget.saturating_sub(1);
        Ok(Expr::Literal(Literal::arbitrary(u)?))
    }

    pub fn literal(value: U256) -> Self {
        Expr::Literal(Literal::Word(value.to_be_bytes::<32>()))
    }

    /// The value the expression has under wrapping 256-bit semantics.
    pub fn evaluate(&self) -> U256 {
        match self {
            Expr::Literal(literal) => literal.value(),
            Expr::Binary(op, lhs, rhs) => op.apply(lhs.evaluate(), rhs.evaluate()),
            Expr::Not(inner) => !inner.evaluate(),
            Expr::Shift(ShiftOp::Left, inner, amount) => inner.evaluate() << usize::from(*amount),
            Expr::Shift(ShiftOp::Right, inner, amount) => inner.evaluate() >> usize::from(*amount),
            Expr::Exp(base, exponent) => base.evaluate().wrapping_pow(U256::from(*exponent)),
            Expr::Select {
                lhs,
                rhs,
                then,
                otherwise,
            } => {
                if lhs.evaluate() < rhs.evaluate() {
                    then.evaluate()
                } else {
                    otherwise.evaluate()
                }
            }
        }
    }

    pub fn render(&self) -> String {
        match self {
            Expr::Literal(literal) => literal.render(),
            Expr::Binary(op, lhs, rhs) => op.render(&lhs.render(), &rhs.render()),
            Expr::Not(inner) => format!("(~{})", inner.render()),
            Expr::Shift(ShiftOp::Left, inner, amount) => format!("({} << {amount})", inner.render()),
            Expr::Shift(ShiftOp::Right, inner, amount) => {
                format!("({} >> {amount})", inner.render())
            }
            Expr::Exp(base, exponent) => format!("({} ** {exponent})", base.render()),
            Expr::Select {
                lhs,
                rhs,
                then,
                otherwise,
            } => format!(
                "({} < {} ? {} : {})",
                lhs.render(),
                rhs.render(),
                then.render(),
                otherwise.render()
            ),
        }
    }

    /// Number of nodes, literals included.
    pub fn node_count(&self) -> usize {
        match self {
            Expr::Literal(_) => 1,
            Expr::Not(inner) | Expr::Shift(_, inner, _) | Expr::Exp(inner, _) => {
                1 + inner.node_count()
            }
            Expr::Binary(_, lhs, rhs) => 1 + lhs.node_count() + rhs.node_count(),
            Expr::Select {
                lhs,
                rhs,
                then,
                otherwise,
            } => 1 + lhs.node_count() + rhs.node_count() + then.node_count() + otherwise.node_count(),
        }
    }

    pub fn depth(&self) -> usize {
        match self {
            Expr::Literal(_) => 0,
            Expr::Not(inner) | Expr::Shift(_, inner, _) | Expr::Exp(inner, _) => 1 + inner.depth(),
            Expr::Binary(_, lhs, rhs) => 1 + lhs.depth().max(rhs.depth()),
            Expr::Select {
                lhs,
                rhs,
                then,
                otherwise,
            } => {
                1 + [lhs, rhs, then, otherwise]
                    .iter()
                    .map(|e| e.depth())
                    .max()
                    .unwrap_or(0)
            }
        }
    }
}

/// The zero-safe helpers referenced by [`BinaryOp::Div`] and [`BinaryOp::Mod`].
pub fn render_helpers(indent: &str) -> String {
    format!(
        "{indent}function {DIV_HELPER}(uint256 a, uint256 b) private pure returns (uint256) {{\n\
         {indent}    return b == 0 ? uint256(0) : a / b;\n\
         {indent}}}\n\
         {indent}function {MOD_HELPER}(uint256 a, uint256 b) private pure returns (uint256) {{\n\
         {indent}    return b == 0 ? uint256(0) : a % b;\n\
         {indent}}}\n"
    )
}
