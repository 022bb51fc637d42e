//! Procedure and program model, and the per-procedure pipeline driver.
//!
//! A [`Procedure`] exclusively owns its instruction arena and CFG. The
//! [`Program`] is an arena of procedures addressed by [`ProcId`]; the only
//! cross-procedure reads are a callee's completed liveness and return
//! summaries. While a procedure's own pipeline runs it is moved out of the
//! arena, which both enforces that exclusivity and lets the liveness engine
//! recurse into callees without aliasing.

use bitflags::bitflags;

use relift_core::{Cfg, Instruction, ProcId, Register, RegisterSet, Width};

use crate::diag::Diagnostics;
use crate::{condcode, du_chain, hlgen, liveness, synthesis};

bitflags! {
    /// Procedure property and degradation flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ProcFlags: u32 {
        /// Library routine; analyzed from its declared summary only.
        const LIB = 0x0001;
        /// Returns a value (some register is live across returns).
        const RETURNS_VALUE = 0x0002;
        /// Variable-argument convention.
        const VARARG = 0x0004;
        /// Degraded: emit raw assembly instead of high-level code.
        const EMIT_ASM = 0x0008;
        /// SI is promoted to a dedicated register-resident local.
        const SI_REGVAR = 0x0010;
        /// DI is promoted to a dedicated register-resident local.
        const DI_REGVAR = 0x0020;
        /// Arguments arrive in registers, not on the stack.
        const REG_ARGS = 0x0040;
    }
}

/// How stack arguments are popped at a call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallConvention {
    /// Pop exactly the declared parameter byte count.
    #[default]
    FixedArity,
    /// Pop whatever the expression stack holds.
    RestOfStack,
}

/// Liveness analysis progress. Tri-state so call-graph cycles are broken
/// deterministically rather than re-entering an in-progress analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LiveState {
    #[default]
    Unvisited,
    InProgress,
    Done,
}

/// Value types, only as far as argument sizing and return-width
/// classification need them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Type {
    ByteSigned,
    ByteUnsigned,
    #[default]
    WordSigned,
    WordUnsigned,
    LongSigned,
    LongUnsigned,
    Pointer,
}

impl Type {
    pub fn width(self) -> Width {
        match self {
            Type::ByteSigned | Type::ByteUnsigned => Width::Byte,
            Type::WordSigned | Type::WordUnsigned | Type::Pointer => Width::Word,
            Type::LongSigned | Type::LongUnsigned => Width::Long,
        }
    }

    /// Size in bytes on the argument stack.
    pub fn size(self) -> i16 {
        match self {
            // Byte arguments are pushed as words.
            Type::ByteSigned | Type::ByteUnsigned => 2,
            _ => self.width().size(),
        }
    }
}

/// A declared formal parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub name: String,
    pub ty: Type,
}

/// Where a return value lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetLocation {
    Reg(Register),
    RegPair { hi: Register, lo: Register },
}

/// Declared or discovered return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetValue {
    pub ty: Type,
    pub loc: RetLocation,
}

impl RetValue {
    /// The identifier naming the return location.
    pub fn ident(&self) -> relift_core::Ident {
        match self.loc {
            RetLocation::Reg(r) => relift_core::Ident::Reg(r),
            RetLocation::RegPair { hi, lo } => relift_core::Ident::RegPair { hi, lo },
        }
    }

    /// The registers making up the return location.
    pub fn registers(&self) -> RegisterSet {
        match self.loc {
            RetLocation::Reg(r) => RegisterSet::of(r),
            RetLocation::RegPair { hi, lo } => RegisterSet::pair(hi, lo),
        }
    }
}

/// One procedure: instruction arena, CFG, and analysis summaries.
#[derive(Debug, Default)]
pub struct Procedure {
    pub name: String,
    /// Entry address.
    pub entry: u64,
    /// The instruction arena blocks index into.
    pub icode: Vec<Instruction>,
    pub cfg: Cfg,

    pub flags: ProcFlags,
    pub convention: CallConvention,
    pub params: Vec<Param>,
    /// Declared byte count of stack parameters.
    pub param_bytes: i16,
    pub ret: Option<RetValue>,

    /// Registers used before definition, as seen from call sites.
    pub live_in: RegisterSet,
    /// Registers this procedure may leave live for its callers.
    pub live_out: RegisterSet,
    pub live_state: LiveState,
}

impl Procedure {
    pub fn new(name: impl Into<String>, entry: u64) -> Self {
        Self {
            name: name.into(),
            entry,
            ..Self::default()
        }
    }

    /// Declares a library routine from its summary: parameters, return
    /// value, and the registers it reads/writes.
    pub fn library(
        name: impl Into<String>,
        params: Vec<Param>,
        ret: Option<RetValue>,
    ) -> Self {
        let mut proc = Self::new(name, 0);
        proc.flags |= ProcFlags::LIB;
        if let Some(ret) = &ret {
            proc.flags |= ProcFlags::RETURNS_VALUE;
            proc.live_out = ret.registers();
        }
        proc.param_bytes = params.iter().map(|p| p.ty.size()).sum();
        proc.params = params;
        proc.live_state = LiveState::Done;
        proc
    }

    /// The set of registers promoted to dedicated locals.
    pub fn regvar_registers(&self) -> RegisterSet {
        let mut set = RegisterSet::EMPTY;
        if self.flags.contains(ProcFlags::SI_REGVAR) {
            set.insert(Register::Si);
        }
        if self.flags.contains(ProcFlags::DI_REGVAR) {
            set.insert(Register::Di);
        }
        set
    }

    /// True when `reg` is a register-resident local of this procedure.
    pub fn is_regvar(&self, reg: Register) -> bool {
        self.regvar_registers().contains(reg)
    }
}

/// The analyzed program: an arena of procedures.
#[derive(Debug, Default)]
pub struct Program {
    pub procs: Vec<Procedure>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a procedure, returning its id.
    pub fn add(&mut self, proc: Procedure) -> ProcId {
        let id = ProcId(self.procs.len() as u32);
        self.procs.push(proc);
        id
    }

    pub fn proc(&self, id: ProcId) -> &Procedure {
        &self.procs[id.0 as usize]
    }

    pub fn proc_mut(&mut self, id: ProcId) -> &mut Procedure {
        &mut self.procs[id.0 as usize]
    }

    /// Analyzes every user procedure not yet reached through a call chain.
    pub fn analyze_all(&mut self, diags: &mut Diagnostics) {
        for i in 0..self.procs.len() {
            let id = ProcId(i as u32);
            if self.procs[i].flags.contains(ProcFlags::LIB) {
                continue;
            }
            if self.procs[i].live_state != LiveState::Unvisited {
                continue;
            }
            self.analyze(id, RegisterSet::EMPTY, diags);
        }
    }

    /// Runs the full analysis pipeline on one procedure: promotion (idioms
    /// included), condition-code elimination, liveness (recursing into
    /// unanalyzed callees), def-use chains, and forward substitution.
    ///
    /// `live_out` is the result context seen from the call site being
    /// analyzed; the program entry is analyzed with an empty context.
    pub fn analyze(&mut self, id: ProcId, mut live_out: RegisterSet, diags: &mut Diagnostics) {
        let idx = id.0 as usize;
        if self.procs[idx].live_state != LiveState::Unvisited {
            return;
        }

        // Move the procedure out of the arena; the placeholder left behind
        // answers re-entrant calls (call-graph cycles) with an in-progress
        // marker and an empty partial summary.
        let mut proc = std::mem::take(&mut self.procs[idx]);
        self.procs[idx].live_state = LiveState::InProgress;
        self.procs[idx].name = proc.name.clone();
        proc.live_state = LiveState::InProgress;

        // Every pass traverses the reverse-postorder array.
        if proc.cfg.rpo().is_empty() && proc.cfg.num_blocks() > 0 {
            proc.cfg.compute_rpo();
        }

        live_out &= !proc.regvar_registers();
        liveness::discover_return(&mut proc, live_out);

        hlgen::promote(&mut proc, diags);
        condcode::eliminate(&mut proc, diags);
        liveness::gen_live_ktes(&mut proc);
        liveness::live_reg_analysis(self, &mut proc, live_out, diags);

        if !proc.flags.contains(ProcFlags::EMIT_ASM) {
            du_chain::gen_du1(self, &mut proc);
            synthesis::find_exps(self, &mut proc);
        }

        proc.live_state = LiveState::Done;
        self.procs[idx] = proc;
    }
}
