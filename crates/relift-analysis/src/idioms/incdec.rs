//! Increment/decrement-in-comparison idioms.
//!
//! C's `++`/`--` operators inside loop conditions survive compilation as
//! short instruction runs around a comparison and conditional jump. Three
//! shapes are recognized:
//!
//! ```text
//!     mov ax, si              inc si                  inc si
//!     inc si                  jg  lab                 mov ax, si
//!     cmp ax, 8                                       cmp ax, 2
//!     jl  lab                                         jl  lab
//!     => jcond (si++ < 8)     => jcond (++si > 0)     => jcond (++si < 2)
//! ```
//!
//! The conditional jump carries the rewritten condition; the rest of the
//! window is invalidated. The variable may be a register-resident local or
//! a stack local; global and memory-indexed variables are detected and
//! declined with a diagnostic.

use relift_core::{Expr, InsnKind, Opcode, Operand, RegisterSet, UnaryOp, Width};

use crate::diag::{DiagnosticKind, Diagnostics};
use crate::idioms::Idiom;
use crate::proc::Procedure;

/// Post-increment/decrement observed through a preceding copy:
/// MOV reg,var; INC var; CMP reg,Y; Jcc. Anchored at the INC.
pub struct PostIncDecJump;

/// Pre-increment/decrement tested against zero: INC var; Jcc.
pub struct PreIncDecZeroJump;

/// Pre-increment/decrement compared against a general operand:
/// INC var; MOV reg,var; CMP reg,Y; Jcc.
pub struct PreIncDecCmpJump;

/// The operand localities an increment idiom distinguishes.
enum Locality {
    RegVar,
    Local,
    Global,
    Indexed,
    Unsuited,
}

fn locality(proc: &Procedure, dst: &Operand) -> Locality {
    match dst {
        Operand::Reg(r) => {
            if proc.is_regvar(*r) {
                Locality::RegVar
            } else {
                Locality::Unsuited
            }
        }
        Operand::Local { .. } => Locality::Local,
        Operand::Glob { .. } => Locality::Global,
        Operand::Idx { .. } => Locality::Indexed,
        Operand::Imm(_) => Locality::Unsuited,
    }
}

fn is_inc_dec(op: Opcode) -> bool {
    matches!(op, Opcode::Inc | Opcode::Dec)
}

fn raw_valid(proc: &Procedure, pos: usize) -> bool {
    let insn = &proc.icode[pos];
    insn.valid && insn.kind == InsnKind::Raw
}

/// MOV reg,var at `mov_pos` copying the incremented variable.
fn mov_copies_var(proc: &Procedure, mov_pos: usize, var: &Operand) -> Option<Operand> {
    let mov = &proc.icode[mov_pos];
    if !raw_valid(proc, mov_pos) || mov.ll.opcode != Opcode::Mov {
        return None;
    }
    if mov.ll.src.as_ref() != Some(var) {
        return None;
    }
    match &mov.ll.dst {
        Some(dst @ Operand::Reg(_)) => Some(dst.clone()),
        _ => None,
    }
}

/// CMP against the copy register at `cmp_pos`, followed by a conditional
/// jump at `jmp_pos`.
fn cmp_and_jump(proc: &Procedure, cmp_pos: usize, jmp_pos: usize, copy: &Operand) -> bool {
    let cmp = &proc.icode[cmp_pos];
    if !raw_valid(proc, cmp_pos) || cmp.ll.opcode != Opcode::Cmp {
        return false;
    }
    if cmp.ll.dst.as_ref() != Some(copy) {
        return false;
    }
    raw_valid(proc, jmp_pos) && matches!(proc.icode[jmp_pos].ll.opcode, Opcode::Jcond(_))
}

/// Attaches `cond` to the jump at `jmp_pos`, folding the condition's
/// register reads into the jump's use set.
fn attach_condition(proc: &mut Procedure, jmp_pos: usize, cond: Expr) {
    let mut uses = RegisterSet::EMPTY;
    cond.collect_registers(&mut uses);
    proc.icode[jmp_pos].du.uses |= uses;
    proc.icode[jmp_pos].set_jcond(cond);
}

impl Idiom for PostIncDecJump {
    fn name(&self) -> &'static str {
        "post-increment jump"
    }

    fn matches(
        &self,
        proc: &Procedure,
        pos: usize,
        start: usize,
        end: usize,
        diags: &mut Diagnostics,
    ) -> bool {
        if pos == start || pos + 2 >= end {
            return false;
        }
        let inc = &proc.icode[pos];
        if !raw_valid(proc, pos) || !is_inc_dec(inc.ll.opcode) {
            return false;
        }
        let Some(var) = inc.ll.dst.clone() else {
            return false;
        };

        match locality(proc, &var) {
            Locality::RegVar | Locality::Local => {
                let Some(copy) = mov_copies_var(proc, pos - 1, &var) else {
                    return false;
                };
                cmp_and_jump(proc, pos + 1, pos + 2, &copy)
            }
            Locality::Global => {
                diags.report(
                    &proc.name,
                    inc.address,
                    DiagnosticKind::UnsupportedIdiomVariant {
                        idiom: self.name(),
                        variant: "global variable",
                    },
                );
                false
            }
            Locality::Indexed => {
                diags.report(
                    &proc.name,
                    inc.address,
                    DiagnosticKind::UnsupportedIdiomVariant {
                        idiom: self.name(),
                        variant: "indexed variable",
                    },
                );
                false
            }
            Locality::Unsuited => false,
        }
    }

    fn action(&self, proc: &mut Procedure, pos: usize) -> usize {
        let is_dec = proc.icode[pos].ll.opcode == Opcode::Dec;
        let var = proc.icode[pos - 1].ll.src.clone();
        let cmp_src = proc.icode[pos + 1].ll.src.clone();
        let Opcode::Jcond(cc) = proc.icode[pos + 2].ll.opcode else {
            unreachable!("post-increment window not anchored at a conditional jump");
        };
        let (Some(var), Some(cmp_src)) = (var, cmp_src) else {
            unreachable!("post-increment window lost its operands");
        };

        let op = if is_dec {
            UnaryOp::PostDec
        } else {
            UnaryOp::PostInc
        };
        let lhs = Expr::unary(op, Expr::from_operand(&var));
        let rhs = Expr::from_operand(&cmp_src);
        let cond = Expr::binary(cc.comparison(), lhs, rhs);
        attach_condition(proc, pos + 2, cond);

        proc.icode[pos - 1].invalidate();
        proc.icode[pos].invalidate();
        proc.icode[pos + 1].invalidate();
        3
    }
}

impl Idiom for PreIncDecZeroJump {
    fn name(&self) -> &'static str {
        "pre-increment jump"
    }

    fn matches(
        &self,
        proc: &Procedure,
        pos: usize,
        _start: usize,
        end: usize,
        diags: &mut Diagnostics,
    ) -> bool {
        if pos + 1 >= end {
            return false;
        }
        let inc = &proc.icode[pos];
        if !raw_valid(proc, pos) || !is_inc_dec(inc.ll.opcode) {
            return false;
        }
        let Some(var) = &inc.ll.dst else {
            return false;
        };

        let jump_follows =
            raw_valid(proc, pos + 1) && matches!(proc.icode[pos + 1].ll.opcode, Opcode::Jcond(_));
        match var {
            // Any register qualifies here: the comparison against zero needs
            // no separate copy.
            Operand::Reg(_) | Operand::Local { .. } => jump_follows,
            Operand::Glob { .. } => {
                diags.report(
                    &proc.name,
                    inc.address,
                    DiagnosticKind::UnsupportedIdiomVariant {
                        idiom: self.name(),
                        variant: "global variable",
                    },
                );
                false
            }
            Operand::Idx { .. } => {
                diags.report(
                    &proc.name,
                    inc.address,
                    DiagnosticKind::UnsupportedIdiomVariant {
                        idiom: self.name(),
                        variant: "indexed variable",
                    },
                );
                false
            }
            Operand::Imm(_) => false,
        }
    }

    fn action(&self, proc: &mut Procedure, pos: usize) -> usize {
        let is_dec = proc.icode[pos].ll.opcode == Opcode::Dec;
        let Some(var) = proc.icode[pos].ll.dst.clone() else {
            unreachable!("pre-increment window lost its operand");
        };
        let Opcode::Jcond(cc) = proc.icode[pos + 1].ll.opcode else {
            unreachable!("pre-increment window not anchored at a conditional jump");
        };

        let op = if is_dec {
            UnaryOp::PreDec
        } else {
            UnaryOp::PreInc
        };
        let lhs = Expr::unary(op, Expr::from_operand(&var));
        let cond = Expr::binary(cc.comparison(), lhs, Expr::konst(0, Width::Word));
        attach_condition(proc, pos + 1, cond);

        proc.icode[pos].invalidate();
        2
    }
}

impl Idiom for PreIncDecCmpJump {
    fn name(&self) -> &'static str {
        "pre-increment comparison jump"
    }

    fn matches(
        &self,
        proc: &Procedure,
        pos: usize,
        _start: usize,
        end: usize,
        diags: &mut Diagnostics,
    ) -> bool {
        if pos + 3 >= end {
            return false;
        }
        let inc = &proc.icode[pos];
        if !raw_valid(proc, pos) || !is_inc_dec(inc.ll.opcode) {
            return false;
        }
        let Some(var) = inc.ll.dst.clone() else {
            return false;
        };

        match locality(proc, &var) {
            Locality::RegVar | Locality::Local => {
                let Some(copy) = mov_copies_var(proc, pos + 1, &var) else {
                    return false;
                };
                cmp_and_jump(proc, pos + 2, pos + 3, &copy)
            }
            Locality::Indexed => {
                diags.report(
                    &proc.name,
                    inc.address,
                    DiagnosticKind::UnsupportedIdiomVariant {
                        idiom: self.name(),
                        variant: "indexed variable",
                    },
                );
                false
            }
            Locality::Global | Locality::Unsuited => false,
        }
    }

    fn action(&self, proc: &mut Procedure, pos: usize) -> usize {
        let is_dec = proc.icode[pos].ll.opcode == Opcode::Dec;
        let var = proc.icode[pos + 1].ll.src.clone();
        let cmp_src = proc.icode[pos + 2].ll.src.clone();
        let Opcode::Jcond(cc) = proc.icode[pos + 3].ll.opcode else {
            unreachable!("pre-increment window not anchored at a conditional jump");
        };
        let (Some(var), Some(cmp_src)) = (var, cmp_src) else {
            unreachable!("pre-increment window lost its operands");
        };

        let op = if is_dec {
            UnaryOp::PreDec
        } else {
            UnaryOp::PreInc
        };
        let lhs = Expr::unary(op, Expr::from_operand(&var));
        let rhs = Expr::from_operand(&cmp_src);
        let cond = Expr::binary(cc.comparison(), lhs, rhs);
        attach_condition(proc, pos + 3, cond);

        proc.icode[pos].invalidate();
        proc.icode[pos + 1].invalidate();
        proc.icode[pos + 2].invalidate();
        4
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::ProcFlags;
    use relift_core::{BinOp, ConditionCode, HighLevel, Instruction, LowLevel, Register};

    fn ll(op: Opcode) -> LowLevel {
        LowLevel::new(op)
    }

    fn post_inc_proc() -> Procedure {
        // mov ax, si ; inc si ; cmp ax, 8 ; jl lab
        let mut proc = Procedure::new("f", 0x100);
        proc.flags |= ProcFlags::SI_REGVAR;
        proc.icode = vec![
            Instruction::new(
                0x100,
                ll(Opcode::Mov)
                    .with_dst(Operand::reg(Register::Ax))
                    .with_src(Operand::reg(Register::Si)),
            ),
            Instruction::new(
                0x102,
                ll(Opcode::Inc).with_dst(Operand::reg(Register::Si)),
            ),
            Instruction::new(
                0x103,
                ll(Opcode::Cmp)
                    .with_dst(Operand::reg(Register::Ax))
                    .with_src(Operand::imm(8, Width::Word)),
            ),
            Instruction::new(0x106, ll(Opcode::Jcond(ConditionCode::Less))),
        ];
        proc
    }

    #[test]
    fn test_post_inc_in_comparison() {
        let mut proc = post_inc_proc();
        let mut diags = Diagnostics::new();

        assert!(PostIncDecJump.matches(&proc, 1, 0, 4, &mut diags));
        let consumed = PostIncDecJump.action(&mut proc, 1);
        assert_eq!(consumed, 3);

        // jcond (si++ < 8)
        match &proc.icode[3].hl {
            Some(HighLevel::Jcond { cond }) => {
                assert_eq!(
                    *cond,
                    Expr::binary(
                        BinOp::Lt,
                        Expr::unary(UnaryOp::PostInc, Expr::reg(Register::Si)),
                        Expr::konst(8, Width::Word),
                    )
                );
            }
            other => panic!("expected jcond, got {:?}", other),
        }

        assert!(!proc.icode[0].valid);
        assert!(!proc.icode[1].valid);
        assert!(!proc.icode[2].valid);
        assert!(proc.icode[3].valid);
        assert!(proc.icode[3].du.uses.contains(Register::Si));
        assert!(diags.is_empty());
    }

    #[test]
    fn test_post_inc_requires_leading_copy() {
        let mut proc = post_inc_proc();
        // Without the MOV the window cannot anchor.
        proc.icode[0].ll.opcode = Opcode::Nop;
        proc.icode[0].ll.dst = None;
        proc.icode[0].ll.src = None;
        let mut diags = Diagnostics::new();
        assert!(!PostIncDecJump.matches(&proc, 1, 0, 4, &mut diags));
    }

    #[test]
    fn test_post_inc_plain_register_declined() {
        let mut proc = post_inc_proc();
        proc.flags.remove(ProcFlags::SI_REGVAR);
        let mut diags = Diagnostics::new();
        assert!(!PostIncDecJump.matches(&proc, 1, 0, 4, &mut diags));
        assert!(diags.is_empty());
    }

    #[test]
    fn test_indexed_variant_declined_with_diagnostic() {
        let mut proc = post_inc_proc();
        proc.icode[1].ll.dst = Some(Operand::Idx {
            base: Some(Register::Bx),
            index: Register::Si,
            off: 0,
            width: Width::Word,
        });
        let mut diags = Diagnostics::new();
        assert!(!PostIncDecJump.matches(&proc, 1, 0, 4, &mut diags));
        assert_eq!(diags.len(), 1);
    }

    #[test]
    fn test_pre_inc_zero_jump() {
        // inc [bp+4] ; jg lab  =>  jcond (++[bp+4] > 0)
        let mut proc = Procedure::new("f", 0x100);
        proc.icode = vec![
            Instruction::new(
                0x100,
                ll(Opcode::Inc).with_dst(Operand::local(4, Width::Word)),
            ),
            Instruction::new(0x103, ll(Opcode::Jcond(ConditionCode::Greater))),
        ];
        let mut diags = Diagnostics::new();

        assert!(PreIncDecZeroJump.matches(&proc, 0, 0, 2, &mut diags));
        assert_eq!(PreIncDecZeroJump.action(&mut proc, 0), 2);

        match &proc.icode[1].hl {
            Some(HighLevel::Jcond { cond }) => {
                assert_eq!(
                    *cond,
                    Expr::binary(
                        BinOp::Gt,
                        Expr::unary(
                            UnaryOp::PreInc,
                            Expr::Ident(relift_core::Ident::Local { off: 4 })
                        ),
                        Expr::konst(0, Width::Word),
                    )
                );
            }
            other => panic!("expected jcond, got {:?}", other),
        }
        assert!(!proc.icode[0].valid);
    }

    #[test]
    fn test_pre_dec_cmp_jump() {
        // dec si ; mov ax, si ; cmp ax, 2 ; jl lab => jcond (--si < 2)
        let mut proc = Procedure::new("f", 0x100);
        proc.flags |= ProcFlags::SI_REGVAR;
        proc.icode = vec![
            Instruction::new(
                0x100,
                ll(Opcode::Dec).with_dst(Operand::reg(Register::Si)),
            ),
            Instruction::new(
                0x101,
                ll(Opcode::Mov)
                    .with_dst(Operand::reg(Register::Ax))
                    .with_src(Operand::reg(Register::Si)),
            ),
            Instruction::new(
                0x103,
                ll(Opcode::Cmp)
                    .with_dst(Operand::reg(Register::Ax))
                    .with_src(Operand::imm(2, Width::Word)),
            ),
            Instruction::new(0x106, ll(Opcode::Jcond(ConditionCode::Less))),
        ];
        let mut diags = Diagnostics::new();

        assert!(PreIncDecCmpJump.matches(&proc, 0, 0, 4, &mut diags));
        assert_eq!(PreIncDecCmpJump.action(&mut proc, 0), 4);

        match &proc.icode[3].hl {
            Some(HighLevel::Jcond { cond }) => {
                assert_eq!(
                    *cond,
                    Expr::binary(
                        BinOp::Lt,
                        Expr::unary(UnaryOp::PreDec, Expr::reg(Register::Si)),
                        Expr::konst(2, Width::Word),
                    )
                );
            }
            other => panic!("expected jcond, got {:?}", other),
        }
        for pos in 0..3 {
            assert!(!proc.icode[pos].valid);
        }
    }
}
