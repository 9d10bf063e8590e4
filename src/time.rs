//! Wrapping 32-bit millisecond time arithmetic (spec §3.3).
//!
//! All timer timestamps are 32-bit unsigned milliseconds on a monotonic
//! clock and overflow is explicit: comparisons are modular, not a plain
//! integer `<`. The wheel's maximum representable interval (short wheel x
//! long wheel, about an hour) is vastly smaller than 2^31ms so overflow
//! never introduces ordering ambiguity between timers that are actually
//! due within the next hour of each other.

/// A 32-bit monotonic millisecond timestamp with wrapping comparisons.
pub type MonoMs = u32;

/// `NETWORK_DELAY` from spec §9's open question: exposed as config rather
/// than the hard-coded 200ms the original Chronos used.
pub const DEFAULT_NETWORK_DELAY_MS: u32 = 200;

/// The hard-coded per-replica / per-site stagger (spec §4.2). Not made
/// configurable: spec calls it out as intentionally fixed, since it only
/// needs to exceed worst-case intra-cluster HTTP replication latency, a
/// property of the deployment rather than of any single timer.
pub const REPLICA_STAGGER_MS: u32 = 2000;

/// Returns `true` if `a` is strictly before `b` on the wrapping number
/// line, i.e. `b` lies within the next half of the wrapping range from
/// `a`. Equivalent to the spec's "`(a - b)` as u32 has its high bit set".
pub fn wrapping_lt(a: MonoMs, b: MonoMs) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// `a <= b` under the same wrapping order as [`wrapping_lt`].
pub fn wrapping_le(a: MonoMs, b: MonoMs) -> bool {
    a == b || wrapping_lt(a, b)
}

/// Saturating wrapping addition of an unsigned delta, used to compute
/// `next_pop_time` from `start_time_mono_ms` plus accumulated offsets.
pub fn wrapping_add(a: MonoMs, delta: u32) -> MonoMs {
    a.wrapping_add(delta)
}

/// Orders two timestamps using wrapping comparison. Not a total order in
/// the mathematical sense for arbitrary pairs (nothing defined over a
/// cyclic group is), but consistent for any set of values that are all
/// within the wheel's representable horizon of one another, which is the
/// only setting timers are ever compared against each other.
pub fn wrapping_cmp(a: MonoMs, b: MonoMs) -> std::cmp::Ordering {
    if a == b {
        std::cmp::Ordering::Equal
    } else if wrapping_lt(a, b) {
        std::cmp::Ordering::Less
    } else {
        std::cmp::Ordering::Greater
    }
}

/// Packs a 32-bit wrapping pop time into a 64-bit heap key so the heap's
/// total order matches wrapping order for any timers inserted within one
/// wheel horizon of "now" (spec §4.3: "shifting the 32-bit pop time left
/// 32 bits so ordering is unambiguous across wrap"). `now` anchors which
/// half of the u32 range is treated as "ahead"; timestamps before `now`
/// (wrapping) sort after timestamps from `now` onward within one full
/// 2^32 cycle, by construction of the rebase below.
pub fn heap_key(pop_time: MonoMs, now: MonoMs) -> u64 {
    let rebased = pop_time.wrapping_sub(now);
    ((rebased as u64) << 32) | (pop_time as u64)
}

/// Source of the wall/monotonic time the handler's tick loop drives off
/// of. A trait so tests can advance time deterministically instead of
/// sleeping real milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> MonoMs;
}

/// Real-clock implementation: milliseconds elapsed since construction,
/// truncated into the wrapping 32-bit space.
pub struct SystemClock {
    epoch: std::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        SystemClock {
            epoch: std::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> MonoMs {
        self.epoch.elapsed().as_millis() as MonoMs
    }
}

/// Wall-clock milliseconds since the Unix epoch, for the `now_wall_ms`
/// argument `timer::json::from_json` needs to translate a legacy
/// `start-time` (wall-clock) field into a monotonic offset (spec §6.2).
/// The monotonic clock itself never uses this — only JSON decoding of
/// the backwards-compatible field does.
pub fn wall_clock_now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
