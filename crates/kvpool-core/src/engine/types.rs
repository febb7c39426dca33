//! Identifier types shared across the engine.

/// Index of a physical block in the pool.
pub type BlockId = usize;

/// Externally assigned request identifier.
pub type RequestId = String;
