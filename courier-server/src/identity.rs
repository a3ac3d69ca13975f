//! Temporary identifier allocation
//!
//! Unauthenticated connections are keyed by a temporary user id drawn from a
//! range that never overlaps real account ids, so both kinds can live in the
//! same registry.

use std::sync::atomic::{AtomicI64, Ordering};

/// Lowest temporary id. Every account id is below this value.
pub const TEMP_ID_FLOOR: i64 = 1 << 60;

/// Issues and classifies temporary user ids
pub trait IdGenerator: Send + Sync {
    /// Allocate a temporary id not shared with any live identity
    fn generate_temporary(&self) -> i64;

    /// Whether `id` belongs to the temporary range
    fn is_temporary(&self, id: i64) -> bool;
}

/// Monotonic generator over `[TEMP_ID_FLOOR, i64::MAX]`
///
/// Ids are never reused within a process lifetime, which is what rules out
/// collisions with live identities.
#[derive(Debug)]
pub struct TempIdGenerator {
    next: AtomicI64,
}

impl Default for TempIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl TempIdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicI64::new(TEMP_ID_FLOOR),
        }
    }
}

impl IdGenerator for TempIdGenerator {
    fn generate_temporary(&self) -> i64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    fn is_temporary(&self, id: i64) -> bool {
        id >= TEMP_ID_FLOOR
    }
}
