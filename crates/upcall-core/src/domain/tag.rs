//! Operation tags.
//!
//! A tag correlates a service agent's response with the request it answers.
//! Tags are issued from a monotonically increasing 64-bit counter, so two live
//! operations never share one (the counter would need centuries to wrap).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier of one submitted operation.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(u64);

impl Tag {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for Tag {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tag-{}", self.0)
    }
}

/// Issues fresh tags. Shared by every submitting thread.
#[derive(Debug)]
pub struct TagAllocator {
    next: AtomicU64,
}

impl TagAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Allocate the next tag.
    pub fn next_tag(&self) -> Tag {
        Tag(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for TagAllocator {
    fn default() -> Self {
        Self::new()
    }
}
