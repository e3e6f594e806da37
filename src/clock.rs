use std::sync::OnceLock;
use std::time::Instant;

/// The instant the loop started. Every timestamp in the data model (§3) is
/// expressed as microseconds since this point, matching the reference's
/// `program_start_time`.
static START: OnceLock<Instant> = OnceLock::new();

/// Pin `START` to the current instant. Idempotent: later calls are no-ops.
/// Must be called once, early in `main`, before any timestamp is taken.
pub fn start() {
    START.get_or_init(Instant::now);
}

/// Microseconds elapsed since [`start`] was called.
pub fn now_us() -> i64 {
    let start = *START.get_or_init(Instant::now);
    start.elapsed().as_micros() as i64
}
