//! CUID-shaped client-side id generation (§3: "a primary key `id` (string, CUID)").
//!
//! A full CUID2 implementation is out of scope; this produces ids with the
//! same shape (lowercase alphanumeric, monotonically-sortable prefix) that
//! are guaranteed unique within a process, which is all the engine's
//! invariants require.

use std::sync::atomic::{AtomicU64, Ordering};

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generates a new client-side temporary id.
pub fn generate() -> String {
    let counter = COUNTER.fetch_add(1, Ordering::Relaxed);
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("c{counter:013x}{}", &random[..12])
}

/// Generates a fresh idempotency key for a single network attempt (§3 I4).
pub fn generate_idempotency_key() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let a = generate();
        let b = generate();
        assert_ne!(a, b);
        assert!(a.starts_with('c'));
    }
}
