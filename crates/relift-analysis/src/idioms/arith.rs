//! Long-arithmetic idioms.
//!
//! 16-bit compilers lower 32-bit addition and subtraction onto register
//! halves:
//!
//! ```text
//!     add ax, [bp-4]
//!     adc dx, [bp-2]      =>  dx:ax = dx:ax + [bp-2]:[bp-4]
//! ```
//!
//! The first instruction carries the synthesized long assignment; the
//! carry-propagating second instruction is invalidated.

use relift_core::{BinOp, Expr, Ident, InsnKind, Opcode, Operand, Width};

use crate::diag::Diagnostics;
use crate::idioms::Idiom;
use crate::proc::Procedure;

/// ADD followed by ADC across two register/stack halves.
pub struct LongAdd;

/// SUB followed by SBB across two register/stack halves.
pub struct LongSub;

impl Idiom for LongAdd {
    fn name(&self) -> &'static str {
        "long addition"
    }

    fn matches(
        &self,
        proc: &Procedure,
        pos: usize,
        _start: usize,
        end: usize,
        _diags: &mut Diagnostics,
    ) -> bool {
        matches_long(proc, pos, end, Opcode::Add, Opcode::Adc)
    }

    fn action(&self, proc: &mut Procedure, pos: usize) -> usize {
        action_long(proc, pos, BinOp::Add)
    }
}

impl Idiom for LongSub {
    fn name(&self) -> &'static str {
        "long subtraction"
    }

    fn matches(
        &self,
        proc: &Procedure,
        pos: usize,
        _start: usize,
        end: usize,
        _diags: &mut Diagnostics,
    ) -> bool {
        matches_long(proc, pos, end, Opcode::Sub, Opcode::Sbb)
    }

    fn action(&self, proc: &mut Procedure, pos: usize) -> usize {
        action_long(proc, pos, BinOp::Sub)
    }
}

fn matches_long(proc: &Procedure, pos: usize, end: usize, first: Opcode, second: Opcode) -> bool {
    if pos + 1 >= end {
        return false;
    }
    let lo = &proc.icode[pos];
    let hi = &proc.icode[pos + 1];
    if !lo.valid || !hi.valid || lo.kind != InsnKind::Raw || hi.kind != InsnKind::Raw {
        return false;
    }
    if lo.ll.opcode != first || hi.ll.opcode != second {
        return false;
    }
    pairable(&lo.ll.dst, &hi.ll.dst) && pairable(&lo.ll.src, &hi.ll.src)
}

/// Operand halves combine into one long identifier only for matching
/// register/register, local/local or immediate/immediate shapes.
fn pairable(lo: &Option<Operand>, hi: &Option<Operand>) -> bool {
    matches!(
        (lo, hi),
        (Some(Operand::Reg(_)), Some(Operand::Reg(_)))
            | (Some(Operand::Local { .. }), Some(Operand::Local { .. }))
            | (Some(Operand::Imm(_)), Some(Operand::Imm(_)))
    )
}

/// The long value named by a low/high operand pair.
fn long_expr(lo: &Operand, hi: &Operand) -> Expr {
    match (lo, hi) {
        (Operand::Reg(lo), Operand::Reg(hi)) => Expr::Ident(Ident::RegPair { hi: *hi, lo: *lo }),
        (Operand::Local { off: lo_off, .. }, Operand::Local { off: hi_off, .. }) => {
            Expr::Ident(Ident::LongLocal {
                hi_off: *hi_off,
                lo_off: *lo_off,
            })
        }
        (Operand::Imm(lo), Operand::Imm(hi)) => Expr::Const {
            value: (hi.value << 16) | (lo.value & 0xffff),
            width: Width::Long,
        },
        // pairable() admits no other shape
        _ => unreachable!("unpairable long operand halves"),
    }
}

fn action_long(proc: &mut Procedure, pos: usize, op: BinOp) -> usize {
    let (lo_dst, lo_src) = {
        let lo = &proc.icode[pos].ll;
        (lo.dst.clone(), lo.src.clone())
    };
    let (hi_dst, hi_src, hi_uses, hi_defs) = {
        let hi = &proc.icode[pos + 1];
        (
            hi.ll.dst.clone(),
            hi.ll.src.clone(),
            hi.du.uses,
            hi.du.defs,
        )
    };

    // matches_long() guarantees all four operands are present and pairable
    let (lo_dst, hi_dst) = match (lo_dst, hi_dst) {
        (Some(a), Some(b)) => (a, b),
        _ => unreachable!("long idiom without destination halves"),
    };
    let (lo_src, hi_src) = match (lo_src, hi_src) {
        (Some(a), Some(b)) => (a, b),
        _ => unreachable!("long idiom without source halves"),
    };

    let lhs = long_expr(&lo_dst, &hi_dst);
    let rhs = Expr::binary(op, lhs.clone(), long_expr(&lo_src, &hi_src));

    let insn = &mut proc.icode[pos];
    insn.du.uses |= hi_uses;
    insn.du.defs |= hi_defs;
    insn.set_assign(lhs, rhs);

    proc.icode[pos + 1].invalidate();
    2
}
