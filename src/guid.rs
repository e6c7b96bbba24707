use std::sync::atomic::{AtomicU64, Ordering};

use rand::RngCore;

/// Process-wide counter mixed into every freshly drawn GUID so that two
/// clients constructed in the same process never collide even if `rand`
/// produces the same seed twice (e.g. under a deterministic test RNG).
static GUID_SALT: AtomicU64 = AtomicU64::new(0);

/// Draws a fresh 64-bit RakNet GUID.
///
/// Upstream RakNet seeds its GUID from address, process id and a few clock
/// reads; we don't have access to those as a library, so we draw from the
/// thread RNG and fold in a process-unique counter, which satisfies the
/// spec's only real requirement: distinct clients in one process never
/// collide.
pub(crate) fn new_guid() -> u64 {
    let salt = GUID_SALT.fetch_add(1, Ordering::Relaxed);
    let random = rand::thread_rng().next_u64();
    random ^ salt.wrapping_mul(0x9E3779B97F4A7C15)
}
