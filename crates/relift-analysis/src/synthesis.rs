//! Forward-substitution expression synthesis.
//!
//! The last pass per procedure. Definitions with exactly one recorded use
//! are folded directly into the use site when the carried expression is
//! x-clear (no register it reads is redefined between definition and use).
//! PUSH operands travel through a pass-scoped expression stack to their
//! CALL, which pops them into an ordered argument list according to the
//! callee's convention. A call result nothing consumed becomes an explicit
//! assignment to the callee's declared return location.

use relift_core::{BlockId, Expr, HighLevel, Ident, Instruction, ProcId, Register, Width};

use crate::proc::{ProcFlags, Procedure, Program, RetLocation, Type};

/// LIFO of pending expression trees, scoped to one procedure's synthesis
/// pass. PUSH-then-CALL argument sequences are reordered through it.
#[derive(Debug, Default)]
pub struct ExprStack {
    items: Vec<Expr>,
}

impl ExprStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, expr: Expr) {
        self.items.push(expr);
    }

    pub fn pop(&mut self) -> Option<Expr> {
        self.items.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

/// The type of a synthesized expression, as far as argument sizing needs.
pub fn expr_type(program: &Program, expr: &Expr) -> Type {
    match expr {
        Expr::Const { width, .. } => match width {
            Width::Byte => Type::ByteSigned,
            Width::Word => Type::WordSigned,
            Width::Long => Type::LongSigned,
        },
        Expr::Ident(Ident::Reg(r)) => {
            if r.is_byte() {
                Type::ByteSigned
            } else {
                Type::WordSigned
            }
        }
        Expr::Ident(Ident::RegPair { .. }) | Expr::Ident(Ident::LongLocal { .. }) => {
            Type::LongSigned
        }
        Expr::Ident(Ident::Local { .. }) | Expr::Ident(Ident::Glob { .. }) => Type::WordSigned,
        Expr::Unary { opnd, .. } => expr_type(program, opnd),
        Expr::Binary { lhs, .. } => expr_type(program, lhs),
        Expr::Call { callee, .. } => program.procs[callee.0 as usize]
            .ret
            .map(|r| r.ty)
            .unwrap_or_default(),
    }
}

/// Coerces an actual argument toward the formal parameter's declared type.
fn adjust_arg_type(expr: &mut Expr, formal: Type) {
    if let Expr::Const { width, .. } = expr {
        *width = formal.width();
    }
}

/// The x-clear predicate: every register-identifier leaf of `expr` must see
/// no redefinition strictly between `def_pos` and `use_pos`. Composite
/// nodes require all children to pass independently; a scan that would run
/// past the block's end is never clear.
pub fn x_clear(
    icode: &[Instruction],
    expr: &Expr,
    def_pos: usize,
    use_pos: usize,
    block_end: usize,
) -> bool {
    match expr {
        Expr::Ident(Ident::Reg(r)) => reg_clear(icode, *r, def_pos, use_pos, block_end),
        Expr::Ident(Ident::RegPair { hi, lo }) => {
            reg_clear(icode, *hi, def_pos, use_pos, block_end)
                && reg_clear(icode, *lo, def_pos, use_pos, block_end)
        }
        Expr::Ident(_) | Expr::Const { .. } => true,
        Expr::Unary { opnd, .. } => x_clear(icode, opnd, def_pos, use_pos, block_end),
        Expr::Binary { lhs, rhs, .. } => {
            x_clear(icode, rhs, def_pos, use_pos, block_end)
                && x_clear(icode, lhs, def_pos, use_pos, block_end)
        }
        Expr::Call { args, .. } => args
            .iter()
            .all(|a| x_clear(icode, a, def_pos, use_pos, block_end)),
    }
}

fn reg_clear(
    icode: &[Instruction],
    reg: Register,
    def_pos: usize,
    use_pos: usize,
    block_end: usize,
) -> bool {
    if use_pos > block_end {
        return false;
    }
    let alias = reg.aliases();
    for pos in def_pos + 1..use_pos {
        let insn = &icode[pos];
        if insn.is_high_level() && insn.valid && insn.du.defs.intersects(alias) {
            return false;
        }
    }
    true
}

/// Runs forward substitution over the whole procedure.
pub fn find_exps(program: &Program, proc: &mut Procedure) {
    let mut stack = ExprStack::new();
    let order: Vec<BlockId> = proc.cfg.rpo().to_vec();

    for bid in order {
        if proc.cfg[bid].invalid {
            continue;
        }
        let (start, end) = (proc.cfg[bid].start, proc.cfg[bid].end());
        let mut num_hl: i32 = 0;

        for pos in start..end {
            {
                let insn = &proc.icode[pos];
                if !insn.is_high_level() || !insn.valid {
                    continue;
                }
            }
            num_hl += 1;

            // Pop stack arguments first so a substituted call expression
            // carries its complete argument list.
            if let Some(HighLevel::Call { callee, .. }) = &proc.icode[pos].hl {
                let callee_id = *callee;
                if !program.procs[callee_id.0 as usize]
                    .flags
                    .contains(ProcFlags::REG_ARGS)
                {
                    pop_call_args(program, proc, pos, callee_id, &mut stack);
                }
            }

            let nrd = proc.icode[pos].du1.num_regs_def;
            if nrd == 1 && proc.icode[pos].du1.num_uses(0) == 1 {
                single_reg_substitution(program, proc, pos, end, &mut stack, &mut num_hl);
            } else if nrd == 2
                && proc.icode[pos].du1.num_uses(0) == 1
                && proc.icode[pos].du1.num_uses(1) == 1
            {
                long_reg_substitution(program, proc, pos, &mut stack, &mut num_hl);
            } else if matches!(proc.icode[pos].hl, Some(HighLevel::Push { .. })) {
                // A push's value is always consumed by a later call.
                if let Some(HighLevel::Push { expr }) = proc.icode[pos].hl.take() {
                    stack.push(expr);
                }
                proc.icode[pos].invalidate();
                num_hl -= 1;
            }

            fallback_call_assign(program, proc, pos);
        }

        proc.cfg[bid].num_hl = num_hl.max(0) as u32;
    }
}

/// Whether the substitution guard allows folding into this target: a last
/// definition may only fold into a call or return.
fn target_blocks_last_def(target: &Instruction) -> bool {
    !matches!(
        target.hl,
        Some(HighLevel::Call { .. }) | Some(HighLevel::Ret { .. })
    )
}

fn single_reg_substitution(
    program: &Program,
    proc: &mut Procedure,
    pos: usize,
    block_end: usize,
    stack: &mut ExprStack,
    num_hl: &mut i32,
) {
    let Some(reg) = proc.icode[pos].du1.defs[0].reg else {
        return;
    };
    let use_pos = proc.icode[pos].du1.defs[0].uses[0];
    let alias = reg.aliases();
    let last_def_blocked = proc.icode[pos].du.last_def.intersects(alias)
        && target_blocks_last_def(&proc.icode[use_pos]);

    match proc.icode[pos].hl.clone() {
        Some(HighLevel::Assign { rhs, .. }) => {
            if last_def_blocked {
                return;
            }
            if x_clear(&proc.icode, &rhs, pos, use_pos, block_end) {
                substitute_into_target(proc, pos, use_pos, reg, rhs, num_hl);
            }
        }

        Some(HighLevel::Pop { .. }) => {
            if last_def_blocked {
                return;
            }
            let Some(popped) = stack.pop() else {
                return;
            };
            match proc.icode[use_pos].hl {
                Some(HighLevel::Assign { .. }) => {
                    forward_subs(proc, pos, use_pos, reg, &popped, num_hl);
                }
                Some(HighLevel::Jcond { .. })
                | Some(HighLevel::Push { .. })
                | Some(HighLevel::Ret { .. }) => {
                    insert_into_slot(proc, pos, use_pos, reg, &popped, num_hl);
                }
                _ => {}
            }
        }

        Some(HighLevel::Call { callee, args }) => {
            single_call_result(program, proc, pos, use_pos, callee, args, num_hl);
        }

        _ => {}
    }
}

/// Folds the defining assignment's right-hand side into the use site.
fn substitute_into_target(
    proc: &mut Procedure,
    def_pos: usize,
    use_pos: usize,
    reg: Register,
    sub: Expr,
    num_hl: &mut i32,
) {
    match proc.icode[use_pos].hl {
        Some(HighLevel::Assign { .. }) => forward_subs(proc, def_pos, use_pos, reg, &sub, num_hl),
        Some(HighLevel::Jcond { .. }) | Some(HighLevel::Push { .. })
        | Some(HighLevel::Ret { .. }) => {
            insert_into_slot(proc, def_pos, use_pos, reg, &sub, num_hl);
        }
        Some(HighLevel::Call { .. }) => {
            // The defined register carries a register-passed argument.
            if let Some(HighLevel::Call { args, .. }) = proc.icode[use_pos].hl.as_mut() {
                args.push(sub);
            }
            proc.icode[def_pos].invalidate();
            *num_hl -= 1;
        }
        _ => {}
    }
}

/// Substitutes into the target assignment's rhs, falling back to its lhs.
fn forward_subs(
    proc: &mut Procedure,
    def_pos: usize,
    use_pos: usize,
    reg: Register,
    sub: &Expr,
    num_hl: &mut i32,
) {
    let Some(HighLevel::Assign { lhs, rhs }) = proc.icode[use_pos].hl.as_mut() else {
        return;
    };
    let ok = rhs.insert_subtree_reg(reg, sub) || lhs.insert_subtree_reg(reg, sub);
    if ok {
        proc.icode[def_pos].invalidate();
        *num_hl -= 1;
    }
}

/// Substitutes into the single expression slot of a Jcond/Push/Ret target.
fn insert_into_slot(
    proc: &mut Procedure,
    def_pos: usize,
    use_pos: usize,
    reg: Register,
    sub: &Expr,
    num_hl: &mut i32,
) {
    let Some(slot) = proc.icode[use_pos].hl_expr_mut() else {
        return;
    };
    if slot.insert_subtree_reg(reg, sub) {
        proc.icode[def_pos].invalidate();
        *num_hl -= 1;
    }
}

/// Folds a single-register call result into its only use.
fn single_call_result(
    program: &Program,
    proc: &mut Procedure,
    def_pos: usize,
    use_pos: usize,
    callee: ProcId,
    args: Vec<Expr>,
    num_hl: &mut i32,
) {
    let Some(rv) = program.procs[callee.0 as usize].ret else {
        return;
    };
    let RetLocation::Reg(ret_reg) = rv.loc else {
        return;
    };
    let call_expr = Expr::Call { callee, args };

    match proc.icode[use_pos].hl.as_mut() {
        Some(HighLevel::Assign { lhs, rhs }) => {
            if !rhs.insert_subtree_reg(ret_reg, &call_expr) {
                lhs.insert_subtree_reg(ret_reg, &call_expr);
            }
            proc.icode[def_pos].invalidate();
            *num_hl -= 1;
        }
        Some(HighLevel::Push { expr }) => {
            *expr = call_expr;
            proc.icode[def_pos].invalidate();
            *num_hl -= 1;
        }
        Some(HighLevel::Ret { expr }) => {
            *expr = Some(call_expr);
            proc.icode[def_pos].invalidate();
            *num_hl -= 1;
        }
        Some(HighLevel::Jcond { cond }) => {
            if cond.insert_subtree_reg(ret_reg, &call_expr) {
                proc.icode[def_pos].invalidate();
                *num_hl -= 1;
            } else {
                // Cannot substitute: bind the result explicitly instead.
                proc.icode[def_pos].set_assign(Expr::Ident(rv.ident()), call_expr);
            }
        }
        _ => {}
    }
}

fn long_reg_substitution(
    program: &Program,
    proc: &mut Procedure,
    pos: usize,
    stack: &mut ExprStack,
    num_hl: &mut i32,
) {
    // Both halves must flow to the same instruction.
    if proc.icode[pos].du1.defs[0].uses[0] != proc.icode[pos].du1.defs[1].uses[0] {
        return;
    }
    let use_pos = proc.icode[pos].du1.defs[0].uses[0];

    match proc.icode[pos].hl.clone() {
        Some(HighLevel::Assign { lhs, rhs }) => {
            let Expr::Ident(Ident::RegPair { hi, lo }) = lhs else {
                return;
            };
            let pair = relift_core::RegisterSet::pair(hi, lo);
            if proc.icode[pos].du.last_def.intersects(pair)
                && target_blocks_last_def(&proc.icode[use_pos])
            {
                return;
            }
            substitute_long_into_target(proc, pos, use_pos, hi, lo, rhs, num_hl);
        }

        Some(HighLevel::Pop { expr }) => {
            let Expr::Ident(Ident::RegPair { hi, lo }) = expr else {
                return;
            };
            let Some(popped) = stack.pop() else {
                return;
            };
            match proc.icode[use_pos].hl {
                Some(HighLevel::Assign { .. }) => {
                    forward_subs_long(proc, pos, use_pos, hi, lo, &popped, num_hl);
                }
                Some(HighLevel::Jcond { .. }) | Some(HighLevel::Push { .. }) => {
                    insert_long_into_slot(proc, pos, use_pos, hi, lo, &popped, num_hl);
                }
                _ => {}
            }
        }

        Some(HighLevel::Call { callee, args }) => {
            long_call_result(program, proc, pos, use_pos, callee, args, num_hl);
        }

        _ => {}
    }
}

fn substitute_long_into_target(
    proc: &mut Procedure,
    def_pos: usize,
    use_pos: usize,
    hi: Register,
    lo: Register,
    sub: Expr,
    num_hl: &mut i32,
) {
    match proc.icode[use_pos].hl {
        Some(HighLevel::Assign { .. }) => {
            forward_subs_long(proc, def_pos, use_pos, hi, lo, &sub, num_hl);
        }
        Some(HighLevel::Jcond { .. }) | Some(HighLevel::Push { .. })
        | Some(HighLevel::Ret { .. }) => {
            insert_long_into_slot(proc, def_pos, use_pos, hi, lo, &sub, num_hl);
        }
        Some(HighLevel::Call { .. }) => {
            if let Some(HighLevel::Call { args, .. }) = proc.icode[use_pos].hl.as_mut() {
                args.push(sub);
            }
            proc.icode[def_pos].invalidate();
            *num_hl -= 1;
        }
        _ => {}
    }
}

fn forward_subs_long(
    proc: &mut Procedure,
    def_pos: usize,
    use_pos: usize,
    hi: Register,
    lo: Register,
    sub: &Expr,
    num_hl: &mut i32,
) {
    let Some(HighLevel::Assign { lhs, rhs }) = proc.icode[use_pos].hl.as_mut() else {
        return;
    };
    let ok = rhs.insert_subtree_long(hi, lo, sub) || lhs.insert_subtree_long(hi, lo, sub);
    if ok {
        proc.icode[def_pos].invalidate();
        *num_hl -= 1;
    }
}

fn insert_long_into_slot(
    proc: &mut Procedure,
    def_pos: usize,
    use_pos: usize,
    hi: Register,
    lo: Register,
    sub: &Expr,
    num_hl: &mut i32,
) {
    let Some(slot) = proc.icode[use_pos].hl_expr_mut() else {
        return;
    };
    if slot.insert_subtree_long(hi, lo, sub) {
        proc.icode[def_pos].invalidate();
        *num_hl -= 1;
    }
}

/// Folds a long (register-pair) call result into its only use.
fn long_call_result(
    program: &Program,
    proc: &mut Procedure,
    def_pos: usize,
    use_pos: usize,
    callee: ProcId,
    args: Vec<Expr>,
    num_hl: &mut i32,
) {
    let Some(rv) = program.procs[callee.0 as usize].ret else {
        return;
    };
    let RetLocation::RegPair { hi, lo } = rv.loc else {
        return;
    };
    let call_expr = Expr::Call { callee, args };

    match proc.icode[use_pos].hl.as_mut() {
        Some(HighLevel::Assign { .. }) => {
            // The pair-assembling target collapses into `pair = call()`.
            proc.icode[use_pos].hl = Some(HighLevel::Assign {
                lhs: Expr::Ident(Ident::RegPair { hi, lo }),
                rhs: call_expr,
            });
            proc.icode[def_pos].invalidate();
            *num_hl -= 1;
        }
        Some(HighLevel::Push { expr }) => {
            *expr = call_expr;
            proc.icode[def_pos].invalidate();
            *num_hl -= 1;
        }
        Some(HighLevel::Ret { expr }) => {
            *expr = Some(call_expr);
            proc.icode[def_pos].invalidate();
            *num_hl -= 1;
        }
        Some(HighLevel::Jcond { cond }) => {
            if cond.insert_subtree_long(hi, lo, &call_expr) {
                proc.icode[def_pos].invalidate();
                *num_hl -= 1;
            } else {
                proc.icode[def_pos].set_assign(Expr::Ident(rv.ident()), call_expr);
            }
        }
        _ => {}
    }
}

/// Pops stack arguments into the call's argument list, in declared
/// parameter order. Fixed-arity callees push left-to-right, so the pops
/// arrive last-parameter-first and are reversed; the declared parameter
/// byte count bounds the pops, advancing by each popped value's type size.
/// Rest-of-stack callees push right-to-left: the pops already arrive in
/// declared order, and the stack drains completely.
fn pop_call_args(
    program: &Program,
    proc: &mut Procedure,
    pos: usize,
    callee_id: ProcId,
    stack: &mut ExprStack,
) {
    let callee = &program.procs[callee_id.0 as usize];
    let mut popped: Vec<Expr> = Vec::new();

    match callee.convention {
        crate::proc::CallConvention::FixedArity => {
            let cb = callee.param_bytes;
            let mut consumed = 0i16;
            while consumed < cb {
                let Some(mut expr) = stack.pop() else {
                    break;
                };
                // The first pop is the last declared parameter.
                if let Some(formal) = callee
                    .params
                    .len()
                    .checked_sub(1 + popped.len())
                    .and_then(|i| callee.params.get(i))
                {
                    adjust_arg_type(&mut expr, formal.ty);
                }
                consumed += expr_type(program, &expr).size();
                popped.push(expr);
            }
            popped.reverse();
        }
        crate::proc::CallConvention::RestOfStack => {
            while let Some(mut expr) = stack.pop() {
                if let Some(formal) = callee.params.get(popped.len()) {
                    adjust_arg_type(&mut expr, formal.ty);
                }
                popped.push(expr);
            }
        }
    }

    if let Some(HighLevel::Call { args, .. }) = proc.icode[pos].hl.as_mut() {
        args.extend(popped);
    }
}

/// A call whose result was never substituted keeps it as an explicit
/// assignment to the declared return location. Plain library calls may
/// discard their return value silently.
fn fallback_call_assign(program: &Program, proc: &mut Procedure, pos: usize) {
    let insn = &proc.icode[pos];
    if !insn.valid {
        return;
    }
    let Some(HighLevel::Call { callee, args }) = &insn.hl else {
        return;
    };
    let callee_proc = &program.procs[callee.0 as usize];
    if callee_proc.flags.contains(ProcFlags::LIB) {
        return;
    }
    if insn.du1.num_regs_def == 0 || insn.du1.used(0) {
        return;
    }
    let Some(rv) = callee_proc.ret else {
        return;
    };

    let call_expr = Expr::Call {
        callee: *callee,
        args: args.clone(),
    };
    proc.icode[pos].set_assign(Expr::Ident(rv.ident()), call_expr);
}
