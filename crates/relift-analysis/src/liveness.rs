//! Register liveness analysis.
//!
//! Two phases per procedure: local live-use/def sets over each block's
//! high-level instructions, then an iterative sweep over the reversed
//! reverse-postorder array until no block's live-in/live-out changes. Call
//! blocks propagate through the callee: an unanalyzed user callee is
//! analyzed on the spot (recursively, bounded by call-graph depth), a
//! library callee contributes its declared live-out only when the caller
//! actually consumes it. Call-graph cycles hit the in-progress placeholder
//! and adopt its partial (empty) live-in instead of re-entering.

use relift_core::{BlockId, BlockKind, Expr, HighLevel, Register, RegisterSet};

use crate::diag::{DiagnosticKind, Diagnostics};
use crate::proc::{ProcFlags, Procedure, Program, RetLocation, RetValue, Type};

/// Classifies the registers live at return into the procedure's return
/// value: DX:AX jointly live means a long; one word register a word; byte
/// halves are joined to their parent word when both live, and otherwise
/// return a byte.
pub fn discover_return(proc: &mut Procedure, live_out: RegisterSet) {
    if !live_out.any() {
        return;
    }
    proc.flags |= ProcFlags::RETURNS_VALUE;

    let mut is_ax = live_out.contains(Register::Ax);
    let is_bx = live_out.contains(Register::Bx);
    let is_cx = live_out.contains(Register::Cx);
    let mut is_dx = live_out.contains(Register::Dx);

    let mut is_al = !is_ax && live_out.contains(Register::Al);
    let is_bl = !is_bx && live_out.contains(Register::Bl);
    let is_cl = !is_cx && live_out.contains(Register::Cl);
    let mut is_dl = !is_dx && live_out.contains(Register::Dl);
    let is_ah = !is_ax && live_out.contains(Register::Ah);
    let is_dh = !is_dx && live_out.contains(Register::Dh);

    if is_al && is_ah {
        is_ax = true;
        is_al = false;
        log::debug!("{}: joined al/ah into ax return", proc.name);
    }
    if is_dl && is_dh {
        is_dx = true;
        is_dl = false;
        log::debug!("{}: joined dl/dh into dx return", proc.name);
    }

    if is_ax && is_dx {
        proc.ret = Some(RetValue {
            ty: Type::LongSigned,
            loc: RetLocation::RegPair {
                hi: Register::Dx,
                lo: Register::Ax,
            },
        });
    } else if is_ax || is_bx || is_cx || is_dx {
        let reg = if is_ax {
            Register::Ax
        } else if is_bx {
            Register::Bx
        } else if is_cx {
            Register::Cx
        } else {
            Register::Dx
        };
        proc.ret = Some(RetValue {
            ty: Type::WordSigned,
            loc: RetLocation::Reg(reg),
        });
    } else if is_al || is_bl || is_cl || is_dl {
        let reg = if is_al {
            Register::Al
        } else if is_bl {
            Register::Bl
        } else if is_cl {
            Register::Cl
        } else {
            Register::Dl
        };
        proc.ret = Some(RetValue {
            ty: Type::ByteSigned,
            loc: RetLocation::Reg(reg),
        });
    }
}

/// Computes each block's local live-use and def sets. A register is locally
/// live-in only when some high-level instruction uses it before any local
/// definition.
pub fn gen_live_ktes(proc: &mut Procedure) {
    let order: Vec<BlockId> = proc.cfg.rpo().to_vec();
    for bid in order {
        if proc.cfg[bid].invalid {
            continue;
        }
        let (start, end) = (proc.cfg[bid].start, proc.cfg[bid].end());

        let mut live_use = RegisterSet::EMPTY;
        let mut def = RegisterSet::EMPTY;
        for pos in start..end {
            let insn = &proc.icode[pos];
            if insn.is_high_level() && insn.valid {
                live_use |= insn.du.uses & !def;
                def |= insn.du.defs;
            }
        }

        let block = &mut proc.cfg[bid];
        block.live_use = live_use;
        block.def = def;
    }
}

/// Iterates live-in/live-out to a fixed point and propagates register usage
/// through call sites. `ctx` is the live-out seen from the caller (empty
/// for the program entry).
pub fn live_reg_analysis(
    program: &mut Program,
    proc: &mut Procedure,
    ctx: RegisterSet,
    diags: &mut Diagnostics,
) {
    proc.live_out = ctx;

    let order: Vec<BlockId> = proc.cfg.rpo().to_vec();
    let mut change = true;
    while change {
        change = false;

        // Reverse array order converges a backward problem quickly.
        for &bid in order.iter().rev() {
            if proc.cfg[bid].invalid {
                continue;
            }
            let prev_in = proc.cfg[bid].live_in;
            let prev_out = proc.cfg[bid].live_out;

            let out_edges = proc.cfg[bid].out_edges.clone();
            let mut new_out = prev_out;

            if out_edges.is_empty() {
                // Return node: the caller's context is what survives.
                new_out = ctx;
                if proc.flags.contains(ProcFlags::RETURNS_VALUE) {
                    seed_return_instruction(proc, bid, ctx);
                }
            } else {
                for edge in &out_edges {
                    new_out |= proc.cfg[edge.to].live_in;
                }
                if proc.cfg[bid].kind == BlockKind::Call {
                    new_out = propagate_call(program, proc, bid, new_out, diags);
                }
            }

            let live_use = proc.cfg[bid].live_use;
            let def = proc.cfg[bid].def;
            let new_in = live_use | (new_out & !def);

            let block = &mut proc.cfg[bid];
            block.live_out = new_out;
            block.live_in = new_in;

            if prev_in != new_in || prev_out != new_out {
                change = true;
            }
        }
    }

    // Propagate the entry block's live-in to the procedure header, with
    // register-resident locals masked out of both.
    if let Some(&entry) = order.first() {
        if proc.cfg[entry].live_in.any() {
            proc.live_in = proc.cfg[entry].live_in;
        }
        let mask = !proc.regvar_registers();
        proc.live_in &= mask;
        proc.cfg[entry].live_in &= mask;
    }
}

/// Binds the return instruction of a value-returning procedure: its use set
/// is the caller's context and its expression the declared return location.
fn seed_return_instruction(proc: &mut Procedure, bid: BlockId, ctx: RegisterSet) {
    let (start, end) = (proc.cfg[bid].start, proc.cfg[bid].end());
    let Some(ret_pos) = (start..end)
        .rev()
        .find(|&p| proc.icode[p].valid && proc.icode[p].is_high_level())
    else {
        return;
    };
    if !matches!(proc.icode[ret_pos].hl, Some(HighLevel::Ret { .. })) {
        return;
    }
    let Some(rv) = proc.ret else {
        return;
    };
    proc.icode[ret_pos].hl = Some(HighLevel::Ret {
        expr: Some(Expr::Ident(rv.ident())),
    });
    proc.icode[ret_pos].du.uses = ctx;
}

/// Resolves a call block's live-out through its callee and copies the
/// callee summary onto the call instruction.
fn propagate_call(
    program: &mut Program,
    proc: &mut Procedure,
    bid: BlockId,
    succ_out: RegisterSet,
    diags: &mut Diagnostics,
) -> RegisterSet {
    let (start, end) = (proc.cfg[bid].start, proc.cfg[bid].end());
    let Some(call_pos) = (start..end).rev().find(|&p| proc.icode[p].valid) else {
        return succ_out;
    };
    let Some(callee_id) = proc.icode[call_pos].hl_callee() else {
        return succ_out;
    };

    let callee_idx = callee_id.0 as usize;
    let callee_is_lib = program.procs[callee_idx].flags.contains(ProcFlags::LIB);

    let new_out = if !callee_is_lib {
        // User routine: analyze it now if nothing has touched it; an
        // in-progress callee (call-graph cycle) contributes its current
        // partial summary instead of re-entering.
        if program.procs[callee_idx].live_state == crate::proc::LiveState::Unvisited {
            program.analyze(callee_id, succ_out, diags);
        }
        program.procs[callee_idx].live_in
    } else {
        // Library routine: its return registers matter only when the
        // immediate successor actually consumes them.
        let callee = &program.procs[callee_idx];
        let succ_live_in = proc.cfg[bid]
            .fall_target()
            .map(|t| proc.cfg[t].live_in)
            .unwrap_or(RegisterSet::EMPTY);
        if callee.flags.contains(ProcFlags::RETURNS_VALUE)
            && callee.live_out.intersects(succ_live_in)
        {
            callee.live_out
        } else {
            RegisterSet::EMPTY
        }
    };

    if !callee_is_lib || new_out.any() {
        let callee = &program.procs[callee_idx];

        // Fix how many registers the call is considered to define from the
        // callee's return width.
        let num_regs_def = match callee.ret.map(|r| r.ty) {
            Some(Type::LongSigned) | Some(Type::LongUnsigned) => 2,
            Some(_) => 1,
            None => {
                if callee.flags.contains(ProcFlags::RETURNS_VALUE) {
                    diags.report(
                        &proc.name,
                        proc.icode[call_pos].address,
                        DiagnosticKind::UnknownReturnType {
                            callee: callee.name.clone(),
                        },
                    );
                }
                0
            }
        };

        let insn = &mut proc.icode[call_pos];
        insn.du1.num_regs_def = num_regs_def;
        insn.du.uses = callee.live_in;
        insn.du.defs = callee.live_out;
    }

    new_out
}

#[cfg(test)]
mod tests {
    use super::*;
    use relift_core::{
        BasicBlock, BlockKind, EdgeKind, Instruction, LowLevel, Opcode, Operand, Width,
    };

    fn mov(addr: u64, dst: Register, src: Register) -> Instruction {
        Instruction::new(
            addr,
            LowLevel::new(Opcode::Mov)
                .with_dst(Operand::reg(dst))
                .with_src(Operand::reg(src)),
        )
    }

    fn mov_imm(addr: u64, dst: Register, value: i32) -> Instruction {
        Instruction::new(
            addr,
            LowLevel::new(Opcode::Mov)
                .with_dst(Operand::reg(dst))
                .with_src(Operand::imm(value, Width::Word)),
        )
    }

    fn promote_all(proc: &mut Procedure) {
        let mut diags = Diagnostics::new();
        crate::hlgen::promote(proc, &mut diags);
    }

    #[test]
    fn test_live_use_only_before_local_def() {
        // ax = bx ; cx = ax — bx is upward-exposed, ax is not.
        let mut proc = Procedure::new("f", 0x100);
        proc.icode = vec![
            mov(0x100, Register::Ax, Register::Bx),
            mov(0x103, Register::Cx, Register::Ax),
        ];
        proc.cfg.add_block(BasicBlock::new(
            relift_core::BlockId::ENTRY,
            0,
            2,
            BlockKind::Return,
        ));
        proc.cfg.compute_rpo();
        promote_all(&mut proc);
        gen_live_ktes(&mut proc);

        let entry = proc.cfg.rpo()[0];
        assert!(proc.cfg[entry].live_use.contains(Register::Bx));
        assert!(!proc.cfg[entry].live_use.contains(Register::Ax));
        assert!(proc.cfg[entry].def.contains(Register::Ax));
        assert!(proc.cfg[entry].def.contains(Register::Cx));
    }

    #[test]
    fn test_fixed_point_across_blocks() {
        // bb0: ax = 1        -> bb1
        // bb1: bx = ax       (return)
        let mut proc = Procedure::new("f", 0x100);
        proc.icode = vec![
            mov_imm(0x100, Register::Ax, 1),
            mov(0x103, Register::Bx, Register::Ax),
        ];
        let b0 = proc.cfg.add_block(BasicBlock::new(
            relift_core::BlockId::ENTRY,
            0,
            1,
            BlockKind::Fall,
        ));
        let b1 = proc.cfg.add_block(BasicBlock::new(
            relift_core::BlockId::ENTRY,
            1,
            1,
            BlockKind::Return,
        ));
        proc.cfg.add_edge(b0, EdgeKind::Fall, b1);
        proc.cfg.compute_rpo();
        promote_all(&mut proc);
        gen_live_ktes(&mut proc);

        let mut program = Program::new();
        let mut diags = Diagnostics::new();
        live_reg_analysis(&mut program, &mut proc, RegisterSet::EMPTY, &mut diags);

        // ax flows from bb0's def to bb1's use.
        assert!(proc.cfg[b0].live_out.contains(Register::Ax));
        assert!(proc.cfg[b1].live_in.contains(Register::Ax));
        // The dataflow equation holds everywhere.
        for bb in proc.cfg.blocks() {
            assert_eq!(bb.live_in, bb.live_use | (bb.live_out & !bb.def));
        }
    }

    #[test]
    fn test_return_node_adopts_context() {
        let mut proc = Procedure::new("f", 0x100);
        proc.icode = vec![
            mov_imm(0x100, Register::Ax, 7),
            Instruction::new(0x103, LowLevel::new(Opcode::Ret)),
        ];
        proc.cfg.add_block(BasicBlock::new(
            relift_core::BlockId::ENTRY,
            0,
            2,
            BlockKind::Return,
        ));
        proc.cfg.compute_rpo();

        let ctx = RegisterSet::of(Register::Ax);
        discover_return(&mut proc, ctx);
        promote_all(&mut proc);
        gen_live_ktes(&mut proc);

        let mut program = Program::new();
        let mut diags = Diagnostics::new();
        live_reg_analysis(&mut program, &mut proc, ctx, &mut diags);

        let entry = proc.cfg.rpo()[0];
        assert_eq!(proc.cfg[entry].live_out, ctx);
        // The ax definition feeds the return.
        assert!(proc.flags.contains(ProcFlags::RETURNS_VALUE));
        match &proc.icode[1].hl {
            Some(HighLevel::Ret { expr: Some(e) }) => {
                assert_eq!(*e, Expr::reg(Register::Ax));
            }
            other => panic!("expected seeded return, got {:?}", other),
        }
        assert_eq!(proc.icode[1].du.uses, ctx);
    }

    #[test]
    fn test_discover_return_widths() {
        let mut long_ret = Procedure::new("f", 0);
        discover_return(
            &mut long_ret,
            RegisterSet::pair(Register::Ax, Register::Dx),
        );
        assert_eq!(
            long_ret.ret,
            Some(RetValue {
                ty: Type::LongSigned,
                loc: RetLocation::RegPair {
                    hi: Register::Dx,
                    lo: Register::Ax
                }
            })
        );

        let mut word_ret = Procedure::new("g", 0);
        discover_return(&mut word_ret, RegisterSet::of(Register::Bx));
        assert_eq!(
            word_ret.ret.map(|r| r.loc),
            Some(RetLocation::Reg(Register::Bx))
        );

        // al+ah live together join into ax.
        let mut joined = Procedure::new("h", 0);
        discover_return(&mut joined, RegisterSet::pair(Register::Al, Register::Ah));
        assert_eq!(
            joined.ret.map(|r| r.loc),
            Some(RetLocation::Reg(Register::Ax))
        );

        let mut byte_ret = Procedure::new("i", 0);
        discover_return(&mut byte_ret, RegisterSet::of(Register::Al));
        assert_eq!(
            byte_ret.ret,
            Some(RetValue {
                ty: Type::ByteSigned,
                loc: RetLocation::Reg(Register::Al)
            })
        );
    }

    #[test]
    fn test_regvar_masked_from_summary() {
        let mut proc = Procedure::new("f", 0x100);
        proc.flags |= ProcFlags::SI_REGVAR;
        // ax = si — si would be live-in were it not register-resident.
        proc.icode = vec![mov(0x100, Register::Ax, Register::Si)];
        proc.cfg.add_block(BasicBlock::new(
            relift_core::BlockId::ENTRY,
            0,
            1,
            BlockKind::Return,
        ));
        proc.cfg.compute_rpo();
        promote_all(&mut proc);
        gen_live_ktes(&mut proc);

        let mut program = Program::new();
        let mut diags = Diagnostics::new();
        live_reg_analysis(&mut program, &mut proc, RegisterSet::EMPTY, &mut diags);

        assert!(!proc.live_in.contains(Register::Si));
        let entry = proc.cfg.rpo()[0];
        assert!(!proc.cfg[entry].live_in.contains(Register::Si));
    }
}
