//! Idiom recognition.
//!
//! An idiom is a fixed-window pattern of raw instructions that a compiler
//! emits for a single source-level construct. Each idiom is a matcher/action
//! pair: the matcher tests opcodes and operand compatibility across the
//! window without mutating anything, and never looks past the owning block's
//! end; the action builds the replacement expression tree, attaches it to
//! the instruction carrying the result, invalidates the other window
//! instructions, and returns how far the outer scan advances.

pub mod arith;
pub mod incdec;

pub use arith::{LongAdd, LongSub};
pub use incdec::{PostIncDecJump, PreIncDecCmpJump, PreIncDecZeroJump};

use crate::diag::Diagnostics;
use crate::proc::Procedure;

/// A fixed-window pattern matcher and rewriter.
pub trait Idiom {
    /// Name used in diagnostics.
    fn name(&self) -> &'static str;

    /// Tests the window anchored at `pos` within the block `[start, end)`.
    /// Must not mutate the procedure; unsupported operand localities are
    /// reported through `diags` and declined.
    fn matches(
        &self,
        proc: &Procedure,
        pos: usize,
        start: usize,
        end: usize,
        diags: &mut Diagnostics,
    ) -> bool;

    /// Rewrites a window previously accepted by [`Idiom::matches`]. Returns
    /// the number of instruction positions the scan advances past.
    fn action(&self, proc: &mut Procedure, pos: usize) -> usize;
}

/// The idiom library, in match-priority order.
pub fn all() -> Vec<Box<dyn Idiom>> {
    vec![
        Box::new(LongAdd),
        Box::new(LongSub),
        Box::new(PostIncDecJump),
        Box::new(PreIncDecCmpJump),
        Box::new(PreIncDecZeroJump),
    ]
}
