//! Instruction representation.
//!
//! An instruction keeps its low-level form (opcode, operand descriptors,
//! flag masks) for the whole of its life; analysis annotates it with
//! register def/use sets, level-1 def-use chains, and, once promoted, a
//! high-level form carrying synthesized expression trees. Invalidation is
//! logical deletion: the slot stays addressable so stored positions remain
//! valid, but every pass skips it.

use smallvec::SmallVec;

use crate::{ConditionFlags, Expr, Operand, Register, RegisterSet};

/// Identifies a procedure within the owning program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProcId(pub u32);

impl std::fmt::Display for ProcId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "proc{}", self.0)
    }
}

/// Condition under which a conditional jump is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConditionCode {
    Below,
    BelowOrEqual,
    AboveOrEqual,
    Above,
    Equal,
    NotEqual,
    Less,
    GreaterOrEqual,
    LessOrEqual,
    Greater,
    Sign,
    NotSign,
}

impl ConditionCode {
    /// The comparison operator a jump on this condition synthesizes into,
    /// given the comparison's operand order `lhs <op> rhs`.
    pub fn comparison(self) -> crate::BinOp {
        use crate::BinOp;
        match self {
            ConditionCode::Below => BinOp::ULt,
            ConditionCode::BelowOrEqual => BinOp::ULe,
            ConditionCode::AboveOrEqual => BinOp::UGe,
            ConditionCode::Above => BinOp::UGt,
            ConditionCode::Equal => BinOp::Eq,
            ConditionCode::NotEqual => BinOp::Ne,
            ConditionCode::Less => BinOp::Lt,
            ConditionCode::GreaterOrEqual => BinOp::Ge,
            ConditionCode::LessOrEqual => BinOp::Le,
            ConditionCode::Greater => BinOp::Gt,
            ConditionCode::Sign => BinOp::Lt,
            ConditionCode::NotSign => BinOp::Ge,
        }
    }

    /// The inverse condition.
    pub fn inverse(self) -> ConditionCode {
        match self {
            ConditionCode::Below => ConditionCode::AboveOrEqual,
            ConditionCode::BelowOrEqual => ConditionCode::Above,
            ConditionCode::AboveOrEqual => ConditionCode::Below,
            ConditionCode::Above => ConditionCode::BelowOrEqual,
            ConditionCode::Equal => ConditionCode::NotEqual,
            ConditionCode::NotEqual => ConditionCode::Equal,
            ConditionCode::Less => ConditionCode::GreaterOrEqual,
            ConditionCode::GreaterOrEqual => ConditionCode::Less,
            ConditionCode::LessOrEqual => ConditionCode::Greater,
            ConditionCode::Greater => ConditionCode::LessOrEqual,
            ConditionCode::Sign => ConditionCode::NotSign,
            ConditionCode::NotSign => ConditionCode::Sign,
        }
    }

    /// Flags the jump reads.
    pub fn flags_used(self) -> ConditionFlags {
        match self {
            ConditionCode::Below | ConditionCode::AboveOrEqual => ConditionFlags::CF,
            ConditionCode::BelowOrEqual | ConditionCode::Above => {
                ConditionFlags::CF | ConditionFlags::ZF
            }
            ConditionCode::Equal | ConditionCode::NotEqual => ConditionFlags::ZF,
            ConditionCode::Less | ConditionCode::GreaterOrEqual => {
                ConditionFlags::SF | ConditionFlags::OF
            }
            ConditionCode::LessOrEqual | ConditionCode::Greater => {
                ConditionFlags::SF | ConditionFlags::OF | ConditionFlags::ZF
            }
            ConditionCode::Sign | ConditionCode::NotSign => ConditionFlags::SF,
        }
    }

    /// The x86 mnemonic suffix.
    pub fn suffix(self) -> &'static str {
        match self {
            ConditionCode::Below => "b",
            ConditionCode::BelowOrEqual => "be",
            ConditionCode::AboveOrEqual => "ae",
            ConditionCode::Above => "a",
            ConditionCode::Equal => "e",
            ConditionCode::NotEqual => "ne",
            ConditionCode::Less => "l",
            ConditionCode::GreaterOrEqual => "ge",
            ConditionCode::LessOrEqual => "le",
            ConditionCode::Greater => "g",
            ConditionCode::Sign => "s",
            ConditionCode::NotSign => "ns",
        }
    }
}

/// Low-level opcodes covered by the analysis core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Mov,
    Add,
    Adc,
    Sub,
    Sbb,
    Cmp,
    Test,
    And,
    Or,
    Xor,
    Inc,
    Dec,
    Neg,
    Not,
    Lea,
    Push,
    Pop,
    Call,
    Ret,
    Jmp,
    Jcond(ConditionCode),
    Jcxz,
    Nop,
}

impl Opcode {
    /// Flags this opcode writes.
    pub fn flags_set(self) -> ConditionFlags {
        match self {
            Opcode::Add | Opcode::Adc | Opcode::Sub | Opcode::Sbb | Opcode::Cmp | Opcode::Neg => {
                ConditionFlags::CF
                    | ConditionFlags::OF
                    | ConditionFlags::SF
                    | ConditionFlags::ZF
                    | ConditionFlags::AF
                    | ConditionFlags::PF
            }
            Opcode::And | Opcode::Or | Opcode::Xor | Opcode::Test => {
                ConditionFlags::CF
                    | ConditionFlags::OF
                    | ConditionFlags::SF
                    | ConditionFlags::ZF
                    | ConditionFlags::PF
            }
            Opcode::Inc | Opcode::Dec => {
                ConditionFlags::OF
                    | ConditionFlags::SF
                    | ConditionFlags::ZF
                    | ConditionFlags::AF
                    | ConditionFlags::PF
            }
            _ => ConditionFlags::empty(),
        }
    }

    /// Flags this opcode reads.
    pub fn flags_used(self) -> ConditionFlags {
        match self {
            Opcode::Adc | Opcode::Sbb => ConditionFlags::CF,
            Opcode::Jcond(cc) => cc.flags_used(),
            _ => ConditionFlags::empty(),
        }
    }

    /// The mnemonic, for display and diagnostics.
    pub fn mnemonic(self) -> String {
        match self {
            Opcode::Mov => "mov".into(),
            Opcode::Add => "add".into(),
            Opcode::Adc => "adc".into(),
            Opcode::Sub => "sub".into(),
            Opcode::Sbb => "sbb".into(),
            Opcode::Cmp => "cmp".into(),
            Opcode::Test => "test".into(),
            Opcode::And => "and".into(),
            Opcode::Or => "or".into(),
            Opcode::Xor => "xor".into(),
            Opcode::Inc => "inc".into(),
            Opcode::Dec => "dec".into(),
            Opcode::Neg => "neg".into(),
            Opcode::Not => "not".into(),
            Opcode::Lea => "lea".into(),
            Opcode::Push => "push".into(),
            Opcode::Pop => "pop".into(),
            Opcode::Call => "call".into(),
            Opcode::Ret => "ret".into(),
            Opcode::Jmp => "jmp".into(),
            Opcode::Jcond(cc) => format!("j{}", cc.suffix()),
            Opcode::Jcxz => "jcxz".into(),
            Opcode::Nop => "nop".into(),
        }
    }
}

/// The raw, decoded form of an instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct LowLevel {
    pub opcode: Opcode,
    pub dst: Option<Operand>,
    pub src: Option<Operand>,
    /// Flags read, as decoded.
    pub flags_used: ConditionFlags,
    /// Flags written, as decoded.
    pub flags_set: ConditionFlags,
    /// Resolved callee for CALL.
    pub target: Option<ProcId>,
}

impl LowLevel {
    /// Creates a low-level form with the opcode's default flag masks.
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            dst: None,
            src: None,
            flags_used: opcode.flags_used(),
            flags_set: opcode.flags_set(),
            target: None,
        }
    }

    /// Sets the destination operand.
    pub fn with_dst(mut self, dst: Operand) -> Self {
        self.dst = Some(dst);
        self
    }

    /// Sets the source operand.
    pub fn with_src(mut self, src: Operand) -> Self {
        self.src = Some(src);
        self
    }

    /// Sets the resolved call target.
    pub fn with_target(mut self, target: ProcId) -> Self {
        self.target = Some(target);
        self
    }

    /// Computes the register def/use sets implied by opcode and operands.
    pub fn effects(&self) -> DefUse {
        let mut du = DefUse::default();
        let dst = self.dst.as_ref();
        let src = self.src.as_ref();

        match self.opcode {
            Opcode::Mov | Opcode::Lea => {
                if let Some(dst) = dst {
                    du.defs |= operand_def(dst);
                    du.uses |= operand_addr_uses(dst);
                }
                if let Some(src) = src {
                    du.uses |= operand_uses(src);
                }
            }
            Opcode::Add
            | Opcode::Adc
            | Opcode::Sub
            | Opcode::Sbb
            | Opcode::And
            | Opcode::Or
            | Opcode::Xor => {
                if let Some(dst) = dst {
                    du.defs |= operand_def(dst);
                    du.uses |= operand_uses(dst);
                }
                if let Some(src) = src {
                    du.uses |= operand_uses(src);
                }
            }
            Opcode::Inc | Opcode::Dec | Opcode::Neg | Opcode::Not => {
                if let Some(dst) = dst {
                    du.defs |= operand_def(dst);
                    du.uses |= operand_uses(dst);
                }
            }
            Opcode::Cmp | Opcode::Test => {
                if let Some(dst) = dst {
                    du.uses |= operand_uses(dst);
                }
                if let Some(src) = src {
                    du.uses |= operand_uses(src);
                }
            }
            Opcode::Push => {
                if let Some(dst) = dst {
                    du.uses |= operand_uses(dst);
                }
            }
            Opcode::Pop => {
                if let Some(dst) = dst {
                    du.defs |= operand_def(dst);
                    du.uses |= operand_addr_uses(dst);
                }
            }
            Opcode::Jcxz => {
                du.uses.insert(Register::Cx);
            }
            // Call def/use comes from the callee's liveness summary; return
            // uses are seeded by the liveness engine.
            Opcode::Call
            | Opcode::Ret
            | Opcode::Jmp
            | Opcode::Jcond(_)
            | Opcode::Nop => {}
        }

        du
    }
}

/// Registers defined when the operand is a plain register destination.
fn operand_def(op: &Operand) -> RegisterSet {
    match op {
        Operand::Reg(r) => RegisterSet::of(*r),
        _ => RegisterSet::EMPTY,
    }
}

/// Registers read when the operand is evaluated as a value.
fn operand_uses(op: &Operand) -> RegisterSet {
    match op {
        Operand::Reg(r) => RegisterSet::of(*r),
        Operand::Imm(_) | Operand::Glob { .. } => RegisterSet::EMPTY,
        Operand::Local { .. } => RegisterSet::of(Register::Bp),
        Operand::Idx { base, index, .. } => {
            let mut set = RegisterSet::of(*index);
            if let Some(base) = base {
                set.insert(*base);
            }
            set
        }
    }
}

/// Registers read to form the operand's address when it is written to.
fn operand_addr_uses(op: &Operand) -> RegisterSet {
    match op {
        Operand::Reg(_) | Operand::Imm(_) | Operand::Glob { .. } => RegisterSet::EMPTY,
        Operand::Local { .. } => RegisterSet::of(Register::Bp),
        Operand::Idx { base, index, .. } => {
            let mut set = RegisterSet::of(*index);
            if let Some(base) = base {
                set.insert(*base);
            }
            set
        }
    }
}

/// Whether an instruction is still raw or has been promoted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsnKind {
    /// As decoded; not yet expressed in high-level form.
    Raw,
    /// Promoted; `hl` carries the high-level form.
    High,
}

/// The high-level form of a promoted instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum HighLevel {
    Assign { lhs: Expr, rhs: Expr },
    Jcond { cond: Expr },
    Push { expr: Expr },
    Pop { expr: Expr },
    Call { callee: ProcId, args: Vec<Expr> },
    Ret { expr: Option<Expr> },
}

/// Register def/use annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DefUse {
    /// Registers read.
    pub uses: RegisterSet,
    /// Registers written.
    pub defs: RegisterSet,
    /// Registers for which this is the last definition reaching the block's
    /// live-out set.
    pub last_def: RegisterSet,
}

/// One tracked register definition with its ordered uses.
#[derive(Debug, Clone, Default)]
pub struct Du1Def {
    pub reg: Option<Register>,
    /// Positions of the using instructions, in search order.
    pub uses: SmallVec<[usize; 4]>,
}

/// Level-1 def-use chains for up to two simultaneously defined registers.
#[derive(Debug, Clone, Default)]
pub struct Du1 {
    /// How many registers this instruction is considered to define.
    pub num_regs_def: u8,
    pub defs: [Du1Def; 2],
}

impl Du1 {
    /// Records a use of the `idx`-th defined register.
    pub fn record_use(&mut self, idx: usize, pos: usize) {
        self.defs[idx].uses.push(pos);
    }

    /// The recorded uses of the `idx`-th defined register.
    pub fn uses(&self, idx: usize) -> &[usize] {
        &self.defs[idx].uses
    }

    pub fn num_uses(&self, idx: usize) -> usize {
        self.defs[idx].uses.len()
    }

    /// Returns true if the `idx`-th definition has any recorded use.
    pub fn used(&self, idx: usize) -> bool {
        !self.defs[idx].uses.is_empty()
    }

    /// Drops every recorded use pointing at `pos` (backpatching after the
    /// instruction at `pos` was invalidated).
    pub fn drop_use(&mut self, pos: usize) {
        for def in &mut self.defs {
            def.uses.retain(|&mut u| u != pos);
        }
    }

    /// Clears all chains.
    pub fn clear(&mut self) {
        self.defs[0] = Du1Def::default();
        self.defs[1] = Du1Def::default();
    }
}

/// A single instruction plus its analysis annotations.
#[derive(Debug, Clone)]
pub struct Instruction {
    /// Virtual address.
    pub address: u64,
    /// The decoded low-level form; preserved across promotion.
    pub ll: LowLevel,
    pub kind: InsnKind,
    /// High-level form, once promoted.
    pub hl: Option<HighLevel>,
    /// Cleared by invalidation; invalid instructions are holes every pass
    /// skips, but the position stays addressable.
    pub valid: bool,
    pub du: DefUse,
    pub du1: Du1,
}

impl Instruction {
    /// Creates an instruction, computing its register def/use sets from the
    /// low-level form.
    pub fn new(address: u64, ll: LowLevel) -> Self {
        let du = ll.effects();
        Self {
            address,
            ll,
            kind: InsnKind::Raw,
            hl: None,
            valid: true,
            du,
            du1: Du1::default(),
        }
    }

    /// Returns true for a valid, promoted instruction.
    pub fn is_high_level(&self) -> bool {
        self.kind == InsnKind::High
    }

    /// Logically deletes the instruction.
    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    /// Promotes to a high-level assignment.
    pub fn set_assign(&mut self, lhs: Expr, rhs: Expr) {
        self.hl = Some(HighLevel::Assign { lhs, rhs });
        self.kind = InsnKind::High;
        self.du1.num_regs_def = self.du.defs.count().min(2) as u8;
    }

    /// Promotes to a conditional jump carrying a boolean condition.
    pub fn set_jcond(&mut self, cond: Expr) {
        self.hl = Some(HighLevel::Jcond { cond });
        self.kind = InsnKind::High;
        self.du1.num_regs_def = 0;
    }

    /// Promotes to an arbitrary high-level form.
    pub fn set_hl(&mut self, hl: HighLevel) {
        self.du1.num_regs_def = match &hl {
            HighLevel::Assign { .. } | HighLevel::Pop { .. } => {
                self.du.defs.count().min(2) as u8
            }
            // Calls get their definition count from the callee's return
            // width during liveness.
            HighLevel::Call { .. } => self.du1.num_regs_def,
            _ => 0,
        };
        self.hl = Some(hl);
        self.kind = InsnKind::High;
    }

    /// The single expression slot of a Jcond/Push/Pop/Ret form.
    pub fn hl_expr(&self) -> Option<&Expr> {
        match self.hl.as_ref()? {
            HighLevel::Jcond { cond } => Some(cond),
            HighLevel::Push { expr } | HighLevel::Pop { expr } => Some(expr),
            HighLevel::Ret { expr } => expr.as_ref(),
            _ => None,
        }
    }

    /// Mutable access to the single expression slot.
    pub fn hl_expr_mut(&mut self) -> Option<&mut Expr> {
        match self.hl.as_mut()? {
            HighLevel::Jcond { cond } => Some(cond),
            HighLevel::Push { expr } | HighLevel::Pop { expr } => Some(expr),
            HighLevel::Ret { expr } => expr.as_mut(),
            _ => None,
        }
    }

    /// The callee of a high-level call.
    pub fn hl_callee(&self) -> Option<ProcId> {
        match self.hl.as_ref()? {
            HighLevel::Call { callee, .. } => Some(*callee),
            _ => None,
        }
    }

    /// Removes one defined register from the instruction after its
    /// definition proved dead. Returns true when the whole instruction was
    /// invalidated (callers must then backpatch chains pointing at it).
    pub fn remove_def_reg(&mut self, reg: Register) -> bool {
        self.du.defs &= !reg.aliases();

        let lhs_is_reg = matches!(
            self.hl,
            Some(HighLevel::Assign {
                lhs: Expr::Ident(crate::expr::Ident::Reg(r)),
                ..
            }) if r == reg
        );

        if self.du1.num_regs_def <= 1 || lhs_is_reg {
            self.invalidate();
            self.du1.num_regs_def = self.du1.num_regs_def.saturating_sub(1);
            return true;
        }

        // Drop the matching chain slot and compact.
        if self.du1.defs[0].reg == Some(reg) {
            self.du1.defs[0] = std::mem::take(&mut self.du1.defs[1]);
        } else {
            self.du1.defs[1] = Du1Def::default();
        }
        self.du1.num_regs_def -= 1;
        false
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#06x}:  ", self.address)?;
        if !self.valid {
            write!(f, "(dead) ")?;
        }
        match &self.hl {
            Some(HighLevel::Assign { lhs, rhs }) => write!(f, "{} = {}", lhs, rhs),
            Some(HighLevel::Jcond { cond }) => write!(f, "jcond {}", cond),
            Some(HighLevel::Push { expr }) => write!(f, "push {}", expr),
            Some(HighLevel::Pop { expr }) => write!(f, "pop {}", expr),
            Some(HighLevel::Call { callee, args }) => {
                write!(f, "call {}(", callee)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
            Some(HighLevel::Ret { expr: Some(e) }) => write!(f, "ret {}", e),
            Some(HighLevel::Ret { expr: None }) => write!(f, "ret"),
            None => {
                write!(f, "{}", self.ll.opcode.mnemonic())?;
                if let Some(dst) = &self.ll.dst {
                    write!(f, " {}", dst)?;
                }
                if let Some(src) = &self.ll.src {
                    write!(f, ", {}", src)?;
                }
                Ok(())
            }
        }
    }
}
