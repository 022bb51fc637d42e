//! Analysis diagnostics.
//!
//! No condition in this crate is fatal: unsupported patterns are reported
//! here and the offending procedure degrades to raw-assembly fallback while
//! the rest of the program keeps analyzing. Every diagnostic carries enough
//! context to be actionable: procedure name, instruction address, and the
//! opcode(s) involved.

use relift_core::Opcode;

/// What went wrong.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// A conditional jump's flag definer is an opcode the eliminator cannot
    /// express as a boolean.
    UnsupportedFlagDefiner { definer: Opcode, jump: Opcode },
    /// A flag-consuming instruction other than a conditional jump paired
    /// with a definer the eliminator does not handle.
    UnsupportedFlagUse { definer: Opcode, user: Opcode },
    /// A flag use with no reaching flag definition in its block.
    FlagDefNotFound { user: Opcode },
    /// An idiom matched an operand locality it does not support.
    UnsupportedIdiomVariant {
        idiom: &'static str,
        variant: &'static str,
    },
    /// A callee's declared return type cannot be mapped to a register width.
    UnknownReturnType { callee: String },
}

impl std::fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiagnosticKind::UnsupportedFlagDefiner { definer, jump } => write!(
                f,
                "conditional jump {} on flags defined by unsupported {}",
                jump.mnemonic(),
                definer.mnemonic()
            ),
            DiagnosticKind::UnsupportedFlagUse { definer, user } => write!(
                f,
                "unsupported flag def/use pair: {} defines, {} uses",
                definer.mnemonic(),
                user.mnemonic()
            ),
            DiagnosticKind::FlagDefNotFound { user } => {
                write!(f, "no definition found for flags used by {}", user.mnemonic())
            }
            DiagnosticKind::UnsupportedIdiomVariant { idiom, variant } => {
                write!(f, "unsupported {} variant: {}", idiom, variant)
            }
            DiagnosticKind::UnknownReturnType { callee } => {
                write!(f, "unknown return type for callee {}, assuming none", callee)
            }
        }
    }
}

/// A located diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// Procedure being analyzed.
    pub proc: String,
    /// Address of the offending instruction.
    pub address: u64,
    pub kind: DiagnosticKind,
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{:#06x}: {}", self.proc, self.address, self.kind)
    }
}

/// Diagnostic sink for one analysis run.
#[derive(Debug, Default)]
pub struct Diagnostics {
    items: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a diagnostic and forwards it to the log.
    pub fn report(&mut self, proc: &str, address: u64, kind: DiagnosticKind) {
        let diag = Diagnostic {
            proc: proc.to_string(),
            address,
            kind,
        };
        log::warn!("{}", diag);
        self.items.push(diag);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
