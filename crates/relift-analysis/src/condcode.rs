//! Condition-code elimination.
//!
//! Rewrites flag-consuming conditional jumps into boolean expression trees
//! by locating the flag-producing instruction. Each block is scanned in
//! reverse; for a flag use the nearest earlier instruction whose defined
//! flags cover the used bits is the definer. Comparisons contribute their
//! operands directly; OR/TEST zero-tests fold into `x == 0` shapes; a
//! counter-zero jump synthesizes `cx == 0` without a flag definer. An
//! unsupported definer/user pair degrades the procedure to raw-assembly
//! fallback instead of producing wrong code.

use relift_core::{
    BinOp, BlockId, Expr, HighLevel, InsnKind, Opcode, Operand, Register, RegisterSet, Width,
};

use crate::diag::{DiagnosticKind, Diagnostics};
use crate::proc::{ProcFlags, Procedure};

/// Eliminates condition codes across the whole procedure.
pub fn eliminate(proc: &mut Procedure, diags: &mut Diagnostics) {
    let order: Vec<BlockId> = proc.cfg.rpo().to_vec();
    for bid in order {
        let (start, end, len, invalid) = {
            let b = &proc.cfg[bid];
            (b.start, b.end(), b.len, b.invalid)
        };
        if invalid {
            continue;
        }

        let mut use_pos = end;
        while use_pos > start {
            use_pos -= 1;

            {
                let insn = &proc.icode[use_pos];
                if insn.kind != InsnKind::Raw || !insn.valid {
                    continue;
                }
            }

            // A jump on the counter register tests cx directly, no flags.
            if proc.icode[use_pos].ll.opcode == Opcode::Jcxz {
                let cond = Expr::binary(
                    BinOp::Eq,
                    Expr::reg(Register::Cx),
                    Expr::konst(0, Width::Word),
                );
                proc.icode[use_pos].du.uses.insert(Register::Cx);
                proc.icode[use_pos].set_jcond(cond);
                continue;
            }

            let use_op = proc.icode[use_pos].ll.opcode;
            let used = proc.icode[use_pos].ll.flags_used;
            if used.is_empty() {
                continue;
            }

            // Find the nearest definition within the same basic block.
            let mut found = false;
            let mut def_pos = use_pos;
            while def_pos > start {
                def_pos -= 1;
                if !proc.icode[def_pos].ll.flags_set.contains(used) {
                    continue;
                }
                found = true;

                if let Opcode::Jcond(cc) = use_op {
                    rewrite_jump(proc, def_pos, use_pos, cc, diags);
                } else {
                    let definer = proc.icode[def_pos].ll.opcode;
                    diags.report(
                        &proc.name,
                        proc.icode[use_pos].address,
                        DiagnosticKind::UnsupportedFlagUse {
                            definer,
                            user: use_op,
                        },
                    );
                    proc.flags |= ProcFlags::EMIT_ASM;
                }
                break;
            }

            if !found {
                if len == 1 && matches!(use_op, Opcode::Jcond(_)) {
                    reuse_extended_block_condition(proc, use_pos, use_op);
                } else {
                    diags.report(
                        &proc.name,
                        proc.icode[use_pos].address,
                        DiagnosticKind::FlagDefNotFound { user: use_op },
                    );
                }
            }
        }
    }
}

/// Builds the boolean for a conditional jump from its flag definer.
fn rewrite_jump(
    proc: &mut Procedure,
    def_pos: usize,
    use_pos: usize,
    cc: relift_core::ConditionCode,
    diags: &mut Diagnostics,
) {
    let definer = proc.icode[def_pos].ll.opcode;
    let (lhs, rhs) = match definer {
        Opcode::Cmp => {
            let (dst, src) = cloned_operands(proc, def_pos);
            let (Some(dst), Some(src)) = (dst, src) else {
                return;
            };
            let lhs = Expr::from_operand(&dst);
            let rhs = Expr::from_operand(&src);
            record_condition_uses(proc, use_pos, &lhs, &rhs);
            (lhs, rhs)
        }

        Opcode::Or => {
            // The OR was promoted to `x = x | y`; its destination is the
            // tested value. A pure self-test folds away entirely.
            let Some(HighLevel::Assign { lhs: or_lhs, .. }) = proc.icode[def_pos].hl.clone()
            else {
                return;
            };
            let zero = zero_for(proc, def_pos);
            let def_regs = proc.icode[def_pos].du.defs;
            proc.icode[use_pos].du.uses |= def_regs;

            let (dst, src) = cloned_operands(proc, def_pos);
            if dst.is_some() && dst == src {
                proc.icode[def_pos].invalidate();
            }
            (or_lhs, zero)
        }

        Opcode::Test => {
            let (dst, src) = cloned_operands(proc, def_pos);
            let (Some(dst), Some(src)) = (dst, src) else {
                return;
            };
            let lhs = Expr::binary(
                BinOp::And,
                Expr::from_operand(&dst),
                Expr::from_operand(&src),
            );
            let rhs = zero_for(proc, def_pos);
            record_condition_uses(proc, use_pos, &lhs, &rhs);
            proc.icode[def_pos].invalidate();
            (lhs, rhs)
        }

        _ => {
            diags.report(
                &proc.name,
                proc.icode[def_pos].address,
                DiagnosticKind::UnsupportedFlagDefiner {
                    definer,
                    jump: Opcode::Jcond(cc),
                },
            );
            proc.flags |= ProcFlags::EMIT_ASM;
            return;
        }
    };

    let cond = Expr::binary(cc.comparison(), lhs, rhs);
    proc.icode[use_pos].set_jcond(cond);
}

/// A degenerate one-instruction block holding only the conditional jump:
/// the preceding block already synthesized the flag state into its own
/// jump condition, which this jump re-operates instead of re-deriving.
fn reuse_extended_block_condition(proc: &mut Procedure, use_pos: usize, use_op: Opcode) {
    let Opcode::Jcond(cc) = use_op else {
        return;
    };
    if use_pos == 0 {
        return;
    }
    let prev = &proc.icode[use_pos - 1];
    let Some(HighLevel::Jcond { cond }) = &prev.hl else {
        return;
    };
    let mut reused = cond.clone();
    reused.change_comparison(cc.comparison());
    let prev_uses = prev.du.uses;

    proc.icode[use_pos].du.uses |= prev_uses;
    proc.icode[use_pos].set_jcond(reused);
}

fn cloned_operands(proc: &Procedure, pos: usize) -> (Option<Operand>, Option<Operand>) {
    let ll = &proc.icode[pos].ll;
    (ll.dst.clone(), ll.src.clone())
}

/// A zero constant matching the definer's operand width.
fn zero_for(proc: &Procedure, def_pos: usize) -> Expr {
    let width = proc.icode[def_pos]
        .ll
        .dst
        .as_ref()
        .map(|o| o.width())
        .unwrap_or(Width::Word);
    Expr::konst(0, width)
}

/// Registers read by the synthesized condition become uses of the jump.
fn record_condition_uses(proc: &mut Procedure, use_pos: usize, lhs: &Expr, rhs: &Expr) {
    let mut uses = RegisterSet::EMPTY;
    lhs.collect_registers(&mut uses);
    rhs.collect_registers(&mut uses);
    proc.icode[use_pos].du.uses |= uses;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hlgen;
    use relift_core::{
        BasicBlock, BlockKind, ConditionCode, Instruction, LowLevel, Operand, Width,
    };

    fn single_block_proc(icode: Vec<Instruction>) -> Procedure {
        let mut proc = Procedure::new("f", 0x100);
        let len = icode.len();
        proc.icode = icode;
        proc.cfg.add_block(BasicBlock::new(
            relift_core::BlockId::ENTRY,
            0,
            len,
            BlockKind::TwoWay,
        ));
        proc.cfg.compute_rpo();
        proc
    }

    fn run(proc: &mut Procedure, diags: &mut Diagnostics) {
        hlgen::promote(proc, diags);
        eliminate(proc, diags);
    }

    #[test]
    fn test_cmp_jump_synthesizes_comparison() {
        // cmp ax, 8 ; jl lab  =>  jcond (ax < 8)
        let mut proc = single_block_proc(vec![
            Instruction::new(
                0x100,
                LowLevel::new(Opcode::Cmp)
                    .with_dst(Operand::reg(Register::Ax))
                    .with_src(Operand::imm(8, Width::Word)),
            ),
            Instruction::new(0x103, LowLevel::new(Opcode::Jcond(ConditionCode::Less))),
        ]);
        let mut diags = Diagnostics::new();
        run(&mut proc, &mut diags);

        match &proc.icode[1].hl {
            Some(HighLevel::Jcond { cond }) => {
                assert_eq!(
                    *cond,
                    Expr::binary(BinOp::Lt, Expr::reg(Register::Ax), Expr::konst(8, Width::Word))
                );
            }
            other => panic!("expected jcond, got {:?}", other),
        }
        // The comparison stays in place as a raw hole.
        assert!(proc.icode[0].valid);
        assert_eq!(proc.icode[0].kind, InsnKind::Raw);
        assert!(proc.icode[1].du.uses.contains(Register::Ax));
        assert!(diags.is_empty());
    }

    #[test]
    fn test_unsigned_comparison_operator() {
        // cmp ax, bx ; jb lab  =>  jcond (ax <u bx)
        let mut proc = single_block_proc(vec![
            Instruction::new(
                0x100,
                LowLevel::new(Opcode::Cmp)
                    .with_dst(Operand::reg(Register::Ax))
                    .with_src(Operand::reg(Register::Bx)),
            ),
            Instruction::new(0x103, LowLevel::new(Opcode::Jcond(ConditionCode::Below))),
        ]);
        let mut diags = Diagnostics::new();
        run(&mut proc, &mut diags);

        match &proc.icode[1].hl {
            Some(HighLevel::Jcond { cond }) => {
                assert!(matches!(cond, Expr::Binary { op: BinOp::ULt, .. }));
            }
            other => panic!("expected jcond, got {:?}", other),
        }
    }

    #[test]
    fn test_or_self_test_folds_to_zero_compare() {
        // or ax, ax ; je lab  =>  jcond (ax == 0), or invalidated
        let mut proc = single_block_proc(vec![
            Instruction::new(
                0x100,
                LowLevel::new(Opcode::Or)
                    .with_dst(Operand::reg(Register::Ax))
                    .with_src(Operand::reg(Register::Ax)),
            ),
            Instruction::new(0x102, LowLevel::new(Opcode::Jcond(ConditionCode::Equal))),
        ]);
        let mut diags = Diagnostics::new();
        run(&mut proc, &mut diags);

        match &proc.icode[1].hl {
            Some(HighLevel::Jcond { cond }) => {
                assert_eq!(
                    *cond,
                    Expr::binary(BinOp::Eq, Expr::reg(Register::Ax), Expr::konst(0, Width::Word))
                );
            }
            other => panic!("expected jcond, got {:?}", other),
        }
        assert!(!proc.icode[0].valid);
        assert!(proc.icode[1].du.uses.contains(Register::Ax));
    }

    #[test]
    fn test_test_builds_masked_zero_compare() {
        // test al, 1 ; jne lab  =>  jcond ((al & 1) != 0)
        let mut proc = single_block_proc(vec![
            Instruction::new(
                0x100,
                LowLevel::new(Opcode::Test)
                    .with_dst(Operand::reg(Register::Al))
                    .with_src(Operand::imm(1, Width::Byte)),
            ),
            Instruction::new(0x102, LowLevel::new(Opcode::Jcond(ConditionCode::NotEqual))),
        ]);
        let mut diags = Diagnostics::new();
        run(&mut proc, &mut diags);

        match &proc.icode[1].hl {
            Some(HighLevel::Jcond { cond }) => {
                assert_eq!(
                    *cond,
                    Expr::binary(
                        BinOp::Ne,
                        Expr::binary(
                            BinOp::And,
                            Expr::reg(Register::Al),
                            Expr::konst(1, Width::Byte)
                        ),
                        Expr::konst(0, Width::Byte)
                    )
                );
            }
            other => panic!("expected jcond, got {:?}", other),
        }
        assert!(!proc.icode[0].valid);
    }

    #[test]
    fn test_jcxz_needs_no_definer() {
        let mut proc = single_block_proc(vec![Instruction::new(
            0x100,
            LowLevel::new(Opcode::Jcxz),
        )]);
        let mut diags = Diagnostics::new();
        run(&mut proc, &mut diags);

        match &proc.icode[0].hl {
            Some(HighLevel::Jcond { cond }) => {
                assert_eq!(
                    *cond,
                    Expr::binary(BinOp::Eq, Expr::reg(Register::Cx), Expr::konst(0, Width::Word))
                );
            }
            other => panic!("expected jcond, got {:?}", other),
        }
        assert!(proc.icode[0].du.uses.contains(Register::Cx));
        assert!(diags.is_empty());
    }

    #[test]
    fn test_unsupported_definer_degrades() {
        // neg ax ; jl lab — NEG is not a supported flag definer.
        let mut proc = single_block_proc(vec![
            Instruction::new(
                0x100,
                LowLevel::new(Opcode::Neg).with_dst(Operand::reg(Register::Ax)),
            ),
            Instruction::new(0x102, LowLevel::new(Opcode::Jcond(ConditionCode::Less))),
        ]);
        let mut diags = Diagnostics::new();
        run(&mut proc, &mut diags);

        assert_eq!(diags.len(), 1);
        assert!(proc.flags.contains(ProcFlags::EMIT_ASM));
        // The jump is left unrewritten.
        assert!(proc.icode[1].hl.is_none());
    }

    #[test]
    fn test_definition_not_found() {
        let mut proc = single_block_proc(vec![
            Instruction::new(
                0x100,
                LowLevel::new(Opcode::Mov)
                    .with_dst(Operand::reg(Register::Ax))
                    .with_src(Operand::imm(0, Width::Word)),
            ),
            Instruction::new(0x103, LowLevel::new(Opcode::Jcond(ConditionCode::Equal))),
        ]);
        let mut diags = Diagnostics::new();
        run(&mut proc, &mut diags);

        assert_eq!(diags.len(), 1);
        assert!(diags
            .iter()
            .any(|d| matches!(d.kind, DiagnosticKind::FlagDefNotFound { .. })));
    }

    #[test]
    fn test_extended_block_reuses_previous_condition() {
        // Block 0: cmp ax, 8 ; jl — block 1 holds only jg, re-operating the
        // same flag state.
        let mut proc = Procedure::new("f", 0x100);
        proc.icode = vec![
            Instruction::new(
                0x100,
                LowLevel::new(Opcode::Cmp)
                    .with_dst(Operand::reg(Register::Ax))
                    .with_src(Operand::imm(8, Width::Word)),
            ),
            Instruction::new(0x103, LowLevel::new(Opcode::Jcond(ConditionCode::Less))),
            Instruction::new(0x105, LowLevel::new(Opcode::Jcond(ConditionCode::Greater))),
        ];
        let b0 = proc.cfg.add_block(BasicBlock::new(
            relift_core::BlockId::ENTRY,
            0,
            2,
            BlockKind::TwoWay,
        ));
        let b1 = proc.cfg.add_block(BasicBlock::new(
            relift_core::BlockId::ENTRY,
            2,
            1,
            BlockKind::TwoWay,
        ));
        proc.cfg.add_edge(b0, relift_core::EdgeKind::Then, b1);
        proc.cfg.compute_rpo();

        let mut diags = Diagnostics::new();
        run(&mut proc, &mut diags);

        match &proc.icode[2].hl {
            Some(HighLevel::Jcond { cond }) => {
                assert_eq!(
                    *cond,
                    Expr::binary(BinOp::Gt, Expr::reg(Register::Ax), Expr::konst(8, Width::Word))
                );
            }
            other => panic!("expected reused jcond, got {:?}", other),
        }
        // The first jump keeps its own condition.
        match &proc.icode[1].hl {
            Some(HighLevel::Jcond { cond }) => {
                assert!(matches!(cond, Expr::Binary { op: BinOp::Lt, .. }));
            }
            other => panic!("expected jcond, got {:?}", other),
        }
        assert!(diags.is_empty());
    }
}
