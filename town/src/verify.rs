//! Verified writes against the eventually-consistent issue store.
//!
//! Concurrent agents can silently lose updates: `bd update` returns
//! success but a racing write wins. Every write that matters is therefore
//! paired with a read-back, retried with linear back-off:
//!
//! ```text
//! for attempt in 1..=N:
//!   write()
//!   read_back()
//!   if read_back matches intent: done
//!   sleep(attempt * base_delay)
//! error
//! ```

use std::time::Duration;

use anyhow::{anyhow, Result};
use tracing::warn;

use crate::beads::{Bead, BeadDelta, BeadStore};

pub const MAX_WRITE_ATTEMPTS: u32 = 3;
pub const WRITE_BACKOFF: Duration = Duration::from_millis(500);

/// Disables the read-back, for stubs that do not track state.
pub const NO_VERIFY_ENV: &str = "GT_TEST_NO_VERIFY";

fn verification_disabled() -> bool {
    std::env::var(NO_VERIFY_ENV)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Apply `delta` to `id` and verify it stuck via `check` against a fresh
/// read. Retries up to [`MAX_WRITE_ATTEMPTS`] times; exhaustion is a hard
/// error carrying the last stored state observed.
pub fn verified_update(
    store: &dyn BeadStore,
    id: &str,
    delta: &BeadDelta,
    check: impl Fn(&Bead) -> bool,
) -> Result<()> {
    let mut last_seen: Option<Bead> = None;
    for attempt in 1..=MAX_WRITE_ATTEMPTS {
        store.update(id, delta)?;
        if verification_disabled() {
            return Ok(());
        }

        let bead = store.show(id)?;
        if check(&bead) {
            return Ok(());
        }

        warn!(
            id,
            attempt,
            status = %bead.status,
            assignee = %bead.assignee,
            "write did not stick, retrying"
        );
        last_seen = Some(bead);
        if attempt < MAX_WRITE_ATTEMPTS {
            std::thread::sleep(WRITE_BACKOFF * attempt);
        }
    }

    let observed = last_seen
        .map(|b| format!("status={} assignee={}", b.status, b.assignee))
        .unwrap_or_else(|| "unknown".to_string());
    Err(anyhow!(
        "update to {id} did not stick after {MAX_WRITE_ATTEMPTS} attempts (stored: {observed})"
    ))
}
