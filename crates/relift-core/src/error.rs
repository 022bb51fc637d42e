//! Error types for relift-core.

use thiserror::Error;

/// Core error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid basic block reference.
    #[error("invalid basic block id: {0:?}")]
    InvalidBlockId(crate::BlockId),

    /// Instruction position not covered by any block.
    #[error("instruction position {0} not inside any block")]
    PositionNotFound(usize),

    /// Irreducible-graph repair is declared but not implemented.
    #[error("irreducible graph repair (node splitting) is not implemented")]
    NodeSplitting,
}
