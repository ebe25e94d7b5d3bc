//! Structural names for fibers and events.
//!
//! A [`Path`] identifies either a fiber or an event. Named paths live in a
//! global namespace and compare equal by string; unique paths are generated
//! from a process-wide monotonic counter and never collide.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_UNIQUE: AtomicU64 = AtomicU64::new(1);

/// Immutable identifier of an event or a fiber.
///
/// Cheap to clone; equality and hashing are structural.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Path {
    /// A string identifier in the global namespace.
    Named(Arc<str>),
    /// A process-unique identifier.
    Unique(u64),
}

impl Path {
    /// Creates a path in the global namespace.
    ///
    /// Two named paths built from the same string compare equal.
    pub fn named(name: &str) -> Self {
        Path::Named(Arc::from(name))
    }

    /// Generates a fresh process-unique path.
    pub fn unique() -> Self {
        Path::Unique(NEXT_UNIQUE.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Path::Named(name) => write!(f, "{}", name),
            Path::Unique(id) => write!(f, "#{}", id),
        }
    }
}
