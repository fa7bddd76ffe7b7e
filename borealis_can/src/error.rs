//!
//! Error definitions
//!

pub use borealis_core::OutOfMemoryError;

/// Errors that can occur when breaking a transfer into frames
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TransmitError {
    /// The transfer was anonymous but its payload does not fit into a single frame
    ///
    /// Anonymous transfers have no reliable source node ID, so the receiving side cannot
    /// reassemble them from multiple frames.
    AnonymousNotSingleFrame,
    /// Memory for the outgoing frames could not be allocated
    ///
    /// The transmit queue is left exactly as it was before the failed operation.
    Memory(OutOfMemoryError),
}

impl From<OutOfMemoryError> for TransmitError {
    fn from(inner: OutOfMemoryError) -> Self {
        TransmitError::Memory(inner)
    }
}
