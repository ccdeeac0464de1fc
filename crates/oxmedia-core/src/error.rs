//! Error types for the media core.
//!
//! Each concern defines its own error next to the code that raises it; this
//! module re-exports them and holds the shared [`MediaContext`] used to make
//! error messages point at a concrete file and block.

use std::fmt;
use std::path::PathBuf;

pub use crate::cache::CacheError;
pub use crate::config::ConfigError;
pub use crate::crypto::DecryptError;
pub use crate::media_core::CoreError;
pub use crate::sidecar::SidecarError;
pub use crate::stream::StreamError;

/// Context for media operations, providing debugging information.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaContext {
    /// Path of the encrypted file
    pub path: Option<PathBuf>,
    /// Block being processed (for content errors)
    pub block_number: Option<u64>,
    /// Operation being performed
    pub operation: Option<&'static str>,
}

impl MediaContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_block(mut self, block_number: u64) -> Self {
        self.block_number = Some(block_number);
        self
    }

    #[must_use]
    pub fn with_operation(mut self, operation: &'static str) -> Self {
        self.operation = Some(operation);
        self
    }
}

impl fmt::Display for MediaContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();

        if let Some(op) = self.operation {
            parts.push(op.to_string());
        }
        if let Some(ref path) = self.path {
            parts.push(format!("at {:?}", path.display()));
        }
        if let Some(block) = self.block_number {
            parts.push(format!("block {block}"));
        }

        if parts.is_empty() {
            write!(f, "(no context)")
        } else {
            write!(f, "{}", parts.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_context_display() {
        assert_eq!(MediaContext::new().to_string(), "(no context)");
    }

    #[test]
    fn test_context_display_order() {
        let ctx = MediaContext::new()
            .with_operation("read_block")
            .with_path("/vault/a.bin")
            .with_block(3);
        assert_eq!(ctx.to_string(), "read_block, at \"/vault/a.bin\", block 3");
    }
}
