//! Synthesized expression trees.
//!
//! Analysis passes progressively replace raw register operands with these
//! trees: the condition-code eliminator builds boolean conditions, the idiom
//! engine builds long-arithmetic and increment forms, and forward
//! substitution folds single-use definitions into their use sites. A subtree
//! attached to two separate instructions must be deep-cloned, never shared.

use crate::instruction::ProcId;
use crate::{Operand, Register, RegisterSet, Width};

/// An identifier leaf: a named storage location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Ident {
    /// A machine register.
    Reg(Register),
    /// A hi:lo register pair holding a long value.
    RegPair { hi: Register, lo: Register },
    /// A BP-relative stack local or parameter.
    Local { off: i16 },
    /// A pair of stack locals holding a long value.
    LongLocal { hi_off: i16, lo_off: i16 },
    /// A global at seg:off.
    Glob { seg: u16, off: u16 },
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum UnaryOp {
    Neg,
    Not,
    PreInc,
    PreDec,
    PostInc,
    PostDec,
    AddrOf,
    Deref,
}

/// Binary operators, comparisons included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    And,
    Or,
    Xor,
    Shl,
    Shr,

    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    ULt,
    ULe,
    UGt,
    UGe,
}

impl BinOp {
    /// Returns the operator string for display.
    pub fn as_str(&self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::And => "&",
            BinOp::Or => "|",
            BinOp::Xor => "^",
            BinOp::Shl => "<<",
            BinOp::Shr => ">>",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt | BinOp::ULt => "<",
            BinOp::Le | BinOp::ULe => "<=",
            BinOp::Gt | BinOp::UGt => ">",
            BinOp::Ge | BinOp::UGe => ">=",
        }
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinOp::Eq
                | BinOp::Ne
                | BinOp::Lt
                | BinOp::Le
                | BinOp::Gt
                | BinOp::Ge
                | BinOp::ULt
                | BinOp::ULe
                | BinOp::UGt
                | BinOp::UGe
        )
    }

    /// The negated comparison, if this is one.
    pub fn negate(&self) -> Option<BinOp> {
        match self {
            BinOp::Eq => Some(BinOp::Ne),
            BinOp::Ne => Some(BinOp::Eq),
            BinOp::Lt => Some(BinOp::Ge),
            BinOp::Le => Some(BinOp::Gt),
            BinOp::Gt => Some(BinOp::Le),
            BinOp::Ge => Some(BinOp::Lt),
            BinOp::ULt => Some(BinOp::UGe),
            BinOp::ULe => Some(BinOp::UGt),
            BinOp::UGt => Some(BinOp::ULe),
            BinOp::UGe => Some(BinOp::ULt),
            _ => None,
        }
    }
}

/// A synthesized expression tree.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Expr {
    Ident(Ident),
    Const { value: i32, width: Width },
    Unary { op: UnaryOp, opnd: Box<Expr> },
    Binary { op: BinOp, lhs: Box<Expr>, rhs: Box<Expr> },
    Call { callee: ProcId, args: Vec<Expr> },
}

impl Expr {
    /// A register identifier.
    pub fn reg(reg: Register) -> Expr {
        Expr::Ident(Ident::Reg(reg))
    }

    /// An integer constant.
    pub fn konst(value: i32, width: Width) -> Expr {
        Expr::Const { value, width }
    }

    pub fn unary(op: UnaryOp, opnd: Expr) -> Expr {
        Expr::Unary {
            op,
            opnd: Box::new(opnd),
        }
    }

    pub fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    /// Builds the identifier or constant for a low-level operand.
    pub fn from_operand(op: &Operand) -> Expr {
        match op {
            Operand::Reg(r) => Expr::Ident(Ident::Reg(*r)),
            Operand::Imm(imm) => Expr::Const {
                value: imm.value,
                width: imm.width,
            },
            Operand::Local { off, .. } => Expr::Ident(Ident::Local { off: *off }),
            Operand::Glob { seg, off, .. } => Expr::Ident(Ident::Glob {
                seg: *seg,
                off: *off,
            }),
            Operand::Idx { index, off, .. } => {
                // Indexed accesses synthesize as *(index + off); the base
                // segment is address formation only.
                let addr = if *off != 0 {
                    Expr::binary(
                        BinOp::Add,
                        Expr::reg(*index),
                        Expr::konst(*off as i32, Width::Word),
                    )
                } else {
                    Expr::reg(*index)
                };
                Expr::unary(UnaryOp::Deref, addr)
            }
        }
    }

    /// A deep-cloned copy with the top-level comparison negated. Non-boolean
    /// trees are wrapped in logical negation via `== 0`.
    pub fn inverted(&self) -> Expr {
        if let Expr::Binary { op, lhs, rhs } = self {
            if let Some(neg) = op.negate() {
                return Expr::Binary {
                    op: neg,
                    lhs: lhs.clone(),
                    rhs: rhs.clone(),
                };
            }
        }
        Expr::binary(BinOp::Eq, self.clone(), Expr::konst(0, Width::Word))
    }

    /// Replaces the top-level comparison operator in place. No effect when
    /// the tree is not rooted at a comparison.
    pub fn change_comparison(&mut self, new_op: BinOp) {
        if let Expr::Binary { op, .. } = self {
            if op.is_comparison() {
                *op = new_op;
            }
        }
    }

    /// Substitutes `sub` for the first occurrence of register `reg` as an
    /// identifier leaf. Returns true when a leaf was replaced.
    pub fn insert_subtree_reg(&mut self, reg: Register, sub: &Expr) -> bool {
        match self {
            Expr::Ident(Ident::Reg(r)) if *r == reg => {
                *self = sub.clone();
                true
            }
            Expr::Ident(_) | Expr::Const { .. } => false,
            Expr::Unary { opnd, .. } => opnd.insert_subtree_reg(reg, sub),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.insert_subtree_reg(reg, sub) || rhs.insert_subtree_reg(reg, sub)
            }
            Expr::Call { args, .. } => args.iter_mut().any(|a| a.insert_subtree_reg(reg, sub)),
        }
    }

    /// Substitutes `sub` for the first occurrence of the hi:lo register pair
    /// as an identifier leaf. Returns true when a leaf was replaced.
    pub fn insert_subtree_long(&mut self, hi: Register, lo: Register, sub: &Expr) -> bool {
        match self {
            Expr::Ident(Ident::RegPair { hi: h, lo: l }) if *h == hi && *l == lo => {
                *self = sub.clone();
                true
            }
            Expr::Ident(_) | Expr::Const { .. } => false,
            Expr::Unary { opnd, .. } => opnd.insert_subtree_long(hi, lo, sub),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.insert_subtree_long(hi, lo, sub) || rhs.insert_subtree_long(hi, lo, sub)
            }
            Expr::Call { args, .. } => args.iter_mut().any(|a| a.insert_subtree_long(hi, lo, sub)),
        }
    }

    /// Accumulates every register named by an identifier leaf, call
    /// arguments included.
    pub fn collect_registers(&self, out: &mut RegisterSet) {
        match self {
            Expr::Ident(Ident::Reg(r)) => out.insert(*r),
            Expr::Ident(Ident::RegPair { hi, lo }) => {
                out.insert(*hi);
                out.insert(*lo);
            }
            Expr::Ident(_) | Expr::Const { .. } => {}
            Expr::Unary { opnd, .. } => opnd.collect_registers(out),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_registers(out);
                rhs.collect_registers(out);
            }
            Expr::Call { args, .. } => {
                for arg in args {
                    arg.collect_registers(out);
                }
            }
        }
    }
}

impl std::fmt::Display for Ident {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Ident::Reg(r) => write!(f, "{}", r.name()),
            Ident::RegPair { hi, lo } => write!(f, "{}:{}", hi.name(), lo.name()),
            Ident::Local { off } => {
                if *off < 0 {
                    write!(f, "[bp-{:#x}]", -(*off as i32))
                } else {
                    write!(f, "[bp+{:#x}]", off)
                }
            }
            Ident::LongLocal { hi_off, lo_off } => {
                write!(f, "[bp{:+#x}]:[bp{:+#x}]", hi_off, lo_off)
            }
            Ident::Glob { seg, off } => write!(f, "[{:04x}:{:04x}]", seg, off),
        }
    }
}

impl std::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expr::Ident(id) => write!(f, "{}", id),
            Expr::Const { value, .. } => write!(f, "{}", value),
            Expr::Unary { op, opnd } => match op {
                UnaryOp::Neg => write!(f, "-{}", opnd),
                UnaryOp::Not => write!(f, "~{}", opnd),
                UnaryOp::PreInc => write!(f, "++{}", opnd),
                UnaryOp::PreDec => write!(f, "--{}", opnd),
                UnaryOp::PostInc => write!(f, "{}++", opnd),
                UnaryOp::PostDec => write!(f, "{}--", opnd),
                UnaryOp::AddrOf => write!(f, "&{}", opnd),
                UnaryOp::Deref => write!(f, "*{}", opnd),
            },
            Expr::Binary { op, lhs, rhs } => write!(f, "({} {} {})", lhs, op.as_str(), rhs),
            Expr::Call { callee, args } => {
                write!(f, "p{}(", callee.0)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
        }
    }
}
