//! Small stand-alone helpers shared by the codec and dispatcher.
use std::time::{SystemTime, UNIX_EPOCH};

/// A label byte whose top two bits are `11` is a compression pointer rather
/// than a length-prefixed label (RFC 1035 §4.1.4).
pub fn is_pointer(b: u8) -> bool {
    b & 0xC0 == 0xC0
}

/// Wall-clock seconds since the epoch, used only for the human-readable
/// query-trace log line (`-d`); all TTL/deadline math uses `Instant`.
pub fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
