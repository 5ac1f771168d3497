//! Error types for admission-control primitives
use std::fmt;

/// Unified error type for the crate.
///
/// Only [`RateProtector::request`](crate::RateProtector::request) is fallible;
/// every other operation degrades silently on stale input so that callers can
/// release or cancel concurrently without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TollboothError {
    /// The request asked for more tokens than the pool can ever hold
    OverMaximumTokens { requested: u32, max: u32 },
    /// The protector has been shut down
    ShutDown,
}

impl fmt::Display for TollboothError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OverMaximumTokens { requested, max } => {
                write!(f, "requested {} tokens but the pool holds at most {}", requested, max)
            }
            Self::ShutDown => write!(f, "protector has been shut down"),
        }
    }
}

impl std::error::Error for TollboothError {}

impl TollboothError {
    /// Check if this error is due to an over-maximum token request
    pub fn is_over_maximum_tokens(&self) -> bool {
        matches!(self, Self::OverMaximumTokens { .. })
    }

    /// Check if this error is due to the protector being shut down
    pub fn is_shut_down(&self) -> bool {
        matches!(self, Self::ShutDown)
    }
}
