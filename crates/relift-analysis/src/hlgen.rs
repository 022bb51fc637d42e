//! Low-level to high-level promotion.
//!
//! Two linear passes per block. The idiom scan runs first, while the whole
//! stream is still raw, so multi-instruction windows see the original
//! opcodes; on a match the scan advances by the idiom's consumed count.
//! Direct promotion then rewrites every surviving raw instruction that has
//! a high-level form. Comparisons, flag-carrying arithmetic halves and
//! conditional jumps stay raw for the condition-code eliminator.

use relift_core::{BinOp, Expr, HighLevel, InsnKind, Opcode, UnaryOp};

use crate::diag::Diagnostics;
use crate::idioms;
use crate::proc::Procedure;

/// Runs idiom recognition and direct promotion over the whole procedure.
pub fn promote(proc: &mut Procedure, diags: &mut Diagnostics) {
    find_idioms(proc, diags);
    promote_remaining(proc);
}

/// Scans each block for idiom windows, rewriting matches in place.
pub fn find_idioms(proc: &mut Procedure, diags: &mut Diagnostics) {
    let idiom_list = idioms::all();
    let ranges: Vec<(usize, usize)> = proc
        .cfg
        .blocks()
        .filter(|b| !b.invalid)
        .map(|b| (b.start, b.end()))
        .collect();

    for (start, end) in ranges {
        let mut pos = start;
        while pos < end {
            let insn = &proc.icode[pos];
            if !insn.valid || insn.kind != InsnKind::Raw {
                pos += 1;
                continue;
            }

            let mut advance = 1;
            for idiom in &idiom_list {
                if idiom.matches(proc, pos, start, end, diags) {
                    advance = idiom.action(proc, pos);
                    break;
                }
            }
            pos += advance.max(1);
        }
    }
}

/// Promotes each remaining raw instruction to its direct high-level form.
pub fn promote_remaining(proc: &mut Procedure) {
    for pos in 0..proc.icode.len() {
        let insn = &proc.icode[pos];
        if !insn.valid || insn.kind != InsnKind::Raw {
            continue;
        }

        let ll = insn.ll.clone();
        let dst = ll.dst.as_ref().map(Expr::from_operand);
        let src = ll.src.as_ref().map(Expr::from_operand);
        let insn = &mut proc.icode[pos];

        match ll.opcode {
            Opcode::Mov => {
                if let (Some(lhs), Some(rhs)) = (dst, src) {
                    insn.set_assign(lhs, rhs);
                }
            }
            Opcode::Add => promote_binary(insn, BinOp::Add, dst, src),
            Opcode::Sub => promote_binary(insn, BinOp::Sub, dst, src),
            Opcode::And => promote_binary(insn, BinOp::And, dst, src),
            Opcode::Or => promote_binary(insn, BinOp::Or, dst, src),
            Opcode::Xor => promote_binary(insn, BinOp::Xor, dst, src),
            Opcode::Inc | Opcode::Dec => {
                if let Some(lhs) = dst {
                    let op = if ll.opcode == Opcode::Inc {
                        BinOp::Add
                    } else {
                        BinOp::Sub
                    };
                    let width = ll.dst.as_ref().map(|o| o.width());
                    let one = Expr::konst(1, width.unwrap_or(relift_core::Width::Word));
                    insn.set_assign(lhs.clone(), Expr::binary(op, lhs, one));
                }
            }
            Opcode::Neg => promote_unary(insn, UnaryOp::Neg, dst),
            Opcode::Not => promote_unary(insn, UnaryOp::Not, dst),
            Opcode::Lea => {
                if let (Some(lhs), Some(rhs)) = (dst, src) {
                    insn.set_assign(lhs, Expr::unary(UnaryOp::AddrOf, rhs));
                }
            }
            Opcode::Push => {
                if let Some(expr) = dst {
                    insn.set_hl(HighLevel::Push { expr });
                }
            }
            Opcode::Pop => {
                if let Some(expr) = dst {
                    insn.set_hl(HighLevel::Pop { expr });
                }
            }
            Opcode::Call => {
                if let Some(callee) = ll.target {
                    insn.set_hl(HighLevel::Call {
                        callee,
                        args: Vec::new(),
                    });
                }
            }
            Opcode::Ret => {
                insn.set_hl(HighLevel::Ret { expr: None });
            }
            // Flag producers/consumers stay raw for condition-code
            // elimination; an ADC/SBB half surviving to this point had no
            // matching idiom and degrades there as well.
            Opcode::Adc
            | Opcode::Sbb
            | Opcode::Cmp
            | Opcode::Test
            | Opcode::Jcond(_)
            | Opcode::Jcxz
            | Opcode::Jmp
            | Opcode::Nop => {}
        }
    }
}

fn promote_binary(
    insn: &mut relift_core::Instruction,
    op: BinOp,
    dst: Option<Expr>,
    src: Option<Expr>,
) {
    if let (Some(lhs), Some(rhs)) = (dst, src) {
        insn.set_assign(lhs.clone(), Expr::binary(op, lhs, rhs));
    }
}

fn promote_unary(insn: &mut relift_core::Instruction, op: UnaryOp, dst: Option<Expr>) {
    if let Some(lhs) = dst {
        insn.set_assign(lhs.clone(), Expr::unary(op, lhs));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::ProcFlags;
    use relift_core::{
        BasicBlock, BlockId, BlockKind, ConditionCode, Instruction, LowLevel, Operand, Register,
        Width,
    };

    fn single_block_proc(icode: Vec<Instruction>) -> Procedure {
        let mut proc = Procedure::new("f", 0x100);
        let len = icode.len();
        proc.icode = icode;
        proc.cfg
            .add_block(BasicBlock::new(BlockId::ENTRY, 0, len, BlockKind::Return));
        proc.cfg.compute_rpo();
        proc
    }

    #[test]
    fn test_direct_promotion_mov_add() {
        let mut proc = single_block_proc(vec![
            Instruction::new(
                0x100,
                LowLevel::new(Opcode::Mov)
                    .with_dst(Operand::reg(Register::Ax))
                    .with_src(Operand::imm(1, Width::Word)),
            ),
            Instruction::new(
                0x103,
                LowLevel::new(Opcode::Add)
                    .with_dst(Operand::reg(Register::Ax))
                    .with_src(Operand::reg(Register::Bx)),
            ),
        ]);
        let mut diags = Diagnostics::new();
        promote(&mut proc, &mut diags);

        assert!(proc.icode[0].is_high_level());
        match &proc.icode[1].hl {
            Some(HighLevel::Assign { lhs, rhs }) => {
                assert_eq!(*lhs, Expr::reg(Register::Ax));
                assert_eq!(
                    *rhs,
                    Expr::binary(BinOp::Add, Expr::reg(Register::Ax), Expr::reg(Register::Bx))
                );
            }
            other => panic!("expected assignment, got {:?}", other),
        }
    }

    #[test]
    fn test_cmp_and_jump_stay_raw() {
        let mut proc = single_block_proc(vec![
            Instruction::new(
                0x100,
                LowLevel::new(Opcode::Cmp)
                    .with_dst(Operand::reg(Register::Ax))
                    .with_src(Operand::imm(3, Width::Word)),
            ),
            Instruction::new(0x103, LowLevel::new(Opcode::Jcond(ConditionCode::Equal))),
        ]);
        let mut diags = Diagnostics::new();
        promote(&mut proc, &mut diags);

        assert_eq!(proc.icode[0].kind, InsnKind::Raw);
        assert_eq!(proc.icode[1].kind, InsnKind::Raw);
    }

    #[test]
    fn test_idiom_scan_runs_before_direct_promotion() {
        // mov ax, si ; inc si ; cmp ax, 8 ; jl lab — the idiom window must
        // see the raw MOV, not a promoted assignment.
        let mut proc = single_block_proc(vec![
            Instruction::new(
                0x100,
                LowLevel::new(Opcode::Mov)
                    .with_dst(Operand::reg(Register::Ax))
                    .with_src(Operand::reg(Register::Si)),
            ),
            Instruction::new(
                0x102,
                LowLevel::new(Opcode::Inc).with_dst(Operand::reg(Register::Si)),
            ),
            Instruction::new(
                0x103,
                LowLevel::new(Opcode::Cmp)
                    .with_dst(Operand::reg(Register::Ax))
                    .with_src(Operand::imm(8, Width::Word)),
            ),
            Instruction::new(0x106, LowLevel::new(Opcode::Jcond(ConditionCode::Less))),
        ]);
        proc.flags |= ProcFlags::SI_REGVAR;
        let mut diags = Diagnostics::new();
        promote(&mut proc, &mut diags);

        assert!(!proc.icode[0].valid);
        assert!(!proc.icode[1].valid);
        assert!(!proc.icode[2].valid);
        assert!(matches!(proc.icode[3].hl, Some(HighLevel::Jcond { .. })));
    }

    #[test]
    fn test_push_and_call_forms() {
        let mut proc = single_block_proc(vec![
            Instruction::new(
                0x100,
                LowLevel::new(Opcode::Push).with_dst(Operand::local(-6, Width::Word)),
            ),
            Instruction::new(
                0x102,
                LowLevel::new(Opcode::Call).with_target(relift_core::ProcId(3)),
            ),
        ]);
        let mut diags = Diagnostics::new();
        promote(&mut proc, &mut diags);

        assert!(matches!(proc.icode[0].hl, Some(HighLevel::Push { .. })));
        match &proc.icode[1].hl {
            Some(HighLevel::Call { callee, args }) => {
                assert_eq!(*callee, relift_core::ProcId(3));
                assert!(args.is_empty());
            }
            other => panic!("expected call, got {:?}", other),
        }
    }
}
