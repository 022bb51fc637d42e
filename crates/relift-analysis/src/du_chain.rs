//! Level-1 def-use chain construction.
//!
//! For each register a high-level instruction defines, the builder records
//! every use reachable by a def-clear path: forward within the block up to
//! the next redefinition, and for value-returning calls one block further,
//! into the fallthrough target where unoptimized code consumes the return
//! register. A definition that reaches no use, is not live out and is not a
//! library-call return is pruned; when pruning empties the instruction the
//! same-block chains pointing at it are backpatched.

use relift_core::{BlockId, HighLevel, Register, RegisterSet};

use crate::proc::{ProcFlags, Procedure, Program};

/// Builds DU1 chains for every block, in reverse-postorder block order.
pub fn gen_du1(program: &Program, proc: &mut Procedure) {
    let order: Vec<BlockId> = proc.cfg.rpo().to_vec();
    for bid in order {
        if proc.cfg[bid].invalid {
            continue;
        }
        gen_block(program, proc, bid);
    }
}

/// Outcome of one forward use scan.
struct ScanResult {
    uses: Vec<usize>,
    stopped_by_redef: bool,
}

fn scan_uses(proc: &Procedure, range: std::ops::Range<usize>, alias: RegisterSet) -> ScanResult {
    let mut uses = Vec::new();
    let mut stopped_by_redef = false;
    for pos in range {
        let insn = &proc.icode[pos];
        if !insn.is_high_level() || !insn.valid {
            continue;
        }
        if insn.du.uses.intersects(alias) {
            uses.push(pos);
        }
        if insn.du.defs.intersects(alias) {
            stopped_by_redef = true;
            break;
        }
    }
    ScanResult {
        uses,
        stopped_by_redef,
    }
}

fn gen_block(program: &Program, proc: &mut Procedure, bid: BlockId) {
    let (start, end, live_out) = {
        let b = &proc.cfg[bid];
        (b.start, b.end(), b.live_out)
    };
    let fall_target = proc.cfg[bid].fall_target();

    for pos in start..end {
        {
            let insn = &proc.icode[pos];
            if !insn.is_high_level() || !insn.valid {
                continue;
            }
        }

        let def_set = proc.icode[pos].du.defs;
        let num_allowed = proc.icode[pos].du1.num_regs_def as usize;
        if num_allowed == 0 {
            continue;
        }

        let mut def_idx = 0usize;
        for reg in def_set.iter().collect::<Vec<Register>>() {
            if def_idx >= num_allowed || def_idx >= 2 {
                break;
            }
            // Register-resident locals are variables, not registers.
            if proc.is_regvar(reg) {
                continue;
            }

            proc.icode[pos].du1.defs[def_idx].reg = Some(reg);
            let alias = reg.aliases();

            if pos + 1 < end {
                let scan = scan_uses(proc, pos + 1..end, alias);
                for &u in &scan.uses {
                    proc.icode[pos].du1.record_use(def_idx, u);
                }
                if !scan.stopped_by_redef && live_out.intersects(alias) {
                    proc.icode[pos].du.last_def |= RegisterSet::of(reg);
                }
            } else if live_out.intersects(alias) {
                proc.icode[pos].du.last_def |= RegisterSet::of(reg);
            }

            // A value-returning call's result is consumed in the fallthrough
            // block on unoptimized code; look one block further.
            let value_call = matches!(
                proc.icode[pos].hl,
                Some(HighLevel::Call { callee, .. })
                    if program.procs[callee.0 as usize]
                        .flags
                        .contains(ProcFlags::RETURNS_VALUE)
            );
            if value_call {
                if let Some(tb) = fall_target {
                    let (ts, te, t_live_out) = {
                        let b = &proc.cfg[tb];
                        (b.start, b.end(), b.live_out)
                    };
                    let scan = scan_uses(proc, ts..te, alias);
                    for &u in &scan.uses {
                        proc.icode[pos].du1.record_use(def_idx, u);
                    }
                    if proc.icode[pos].du1.used(def_idx) && t_live_out.intersects(alias) {
                        proc.icode[pos].du.last_def |= RegisterSet::of(reg);
                    }
                }
            }

            prune_dead_definition(program, proc, pos, def_idx, reg, live_out, start);
            if !proc.icode[pos].valid {
                break;
            }
            def_idx += 1;
        }
    }
}

/// Removes a definition that reaches nothing. Library-call returns are
/// kept: routines such as printf return a value most callers ignore.
fn prune_dead_definition(
    program: &Program,
    proc: &mut Procedure,
    pos: usize,
    def_idx: usize,
    reg: Register,
    live_out: RegisterSet,
    block_start: usize,
) {
    let alias = reg.aliases();
    let insn = &proc.icode[pos];
    if !insn.valid || insn.du1.used(def_idx) || insn.du.last_def.intersects(alias) {
        return;
    }
    let lib_call = matches!(
        insn.hl,
        Some(HighLevel::Call { callee, .. })
            if program.procs[callee.0 as usize].flags.contains(ProcFlags::LIB)
    );
    if lib_call {
        return;
    }

    if live_out.intersects(alias) {
        proc.icode[pos].du.last_def |= RegisterSet::of(reg);
        return;
    }

    if proc.icode[pos].remove_def_reg(reg) {
        // The instruction became a hole; drop same-block chains pointing
        // at it.
        for bp in (block_start..pos).rev() {
            proc.icode[bp].du1.drop_use(pos);
        }
    }
}
