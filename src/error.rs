//! Error types for backbone construction, input validation and weight loading

use thiserror::Error;

/// Errors surfaced by the backbone
#[derive(Error, Debug)]
pub enum BackboneError {
    /// Stage or fusion wiring produces tensors that cannot be combined.
    ///
    /// This is a construction-time error: a backbone that builds successfully
    /// never hits it during a forward pass.
    #[error("shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Which connection failed (e.g. "fusion3 input")
        context: String,
        /// Expected dimensions
        expected: Vec<usize>,
        /// Actual dimensions
        actual: Vec<usize>,
    },

    /// Pretrained weight identifier is not in the registry.
    ///
    /// The backbone remains usable with its initialized weights.
    #[error("unknown model identifier: {0}")]
    UnknownModel(String),

    /// Input feature map fails validation before any computation runs
    #[error("invalid input: {0}")]
    InvalidInput(String),
}
