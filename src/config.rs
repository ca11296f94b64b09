use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::path::PathBuf;
use std::time::Duration;

/// Minimum mapped-page growth quantum for column and event files (64 KiB).
const PAGE_SIZE_MIN_LIMIT: u64 = 64 * 1024;

/// Maximum mapped-page growth quantum (256 MiB).
const PAGE_SIZE_MAX_LIMIT: u64 = 256 * 1024 * 1024;

/// Default mapped-page growth quantum.
const DEFAULT_DATA_APPEND_PAGE_SIZE: u64 = 1024 * 1024;

/// Default number of rows a segment accumulates before commit schedules a roll.
const DEFAULT_SEGMENT_ROLLOVER_ROW_COUNT: u64 = 200_000;

/// Default bound on spinning for a consistent base-table metadata read.
const DEFAULT_SPIN_LOCK_TIMEOUT_MS: u64 = 1_000;

/// Rounds a requested page size into the power-of-two growth quantum the
/// mapped-file layer works in.
///
/// Mapped column and event files grow by whole quanta and are remapped at
/// quantum boundaries, so the value must be a power of two inside
/// `[min, max]`. A request between two powers rounds to the nearer one,
/// taking the larger on an exact tie so growth never undershoots what the
/// caller asked for.
#[inline]
fn page_size_quantum(requested: u64, min: u64, max: u64) -> u64 {
    let clamped = requested.clamp(min, max);
    if clamped.is_power_of_two() {
        return clamped;
    }
    let upper = clamped.next_power_of_two().min(max);
    let lower = (upper >> 1).max(min);
    if clamped - lower < upper - clamped {
        lower
    } else {
        upper
    }
}

/// Logical identifier of a segment within one writer's WAL directory.
///
/// Segment ids start at 0 when the writer opens and increase by one on every
/// roll; the id doubles as the segment's directory name.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SegmentId(pub u32);

impl SegmentId {
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the next segment id in sequence.
    #[inline]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Configuration surface for a WAL writer instance.
///
/// Values loaded from external sources should be passed through
/// [`WalConfig::normalized`], which rounds the page size into its
/// power-of-two window and replaces zero values with defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    /// Database root; tables live in `<db_root>/<table>`.
    pub db_root: PathBuf,

    /// Growth quantum for memory-mapped append files (bytes, power of two).
    pub data_append_page_size: u64,

    /// Row count at which a commit schedules a segment roll on the next row.
    pub segment_rollover_row_count: u64,

    /// Upper bound on spinning for a consistent read of the base table's
    /// `_txn` / `_cv` files during symbol dictionary setup (milliseconds).
    pub spin_lock_timeout_ms: u64,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            db_root: PathBuf::from("./data"),
            data_append_page_size: DEFAULT_DATA_APPEND_PAGE_SIZE,
            segment_rollover_row_count: DEFAULT_SEGMENT_ROLLOVER_ROW_COUNT,
            spin_lock_timeout_ms: DEFAULT_SPIN_LOCK_TIMEOUT_MS,
        }
    }
}

impl WalConfig {
    /// Returns a copy with the page size rounded into its power-of-two window
    /// and zero values replaced with defaults.
    pub fn normalized(mut self) -> Self {
        let page_raw = if self.data_append_page_size == 0 {
            DEFAULT_DATA_APPEND_PAGE_SIZE
        } else {
            self.data_append_page_size
        };
        self.data_append_page_size =
            page_size_quantum(page_raw, PAGE_SIZE_MIN_LIMIT, PAGE_SIZE_MAX_LIMIT);

        if self.segment_rollover_row_count == 0 {
            self.segment_rollover_row_count = DEFAULT_SEGMENT_ROLLOVER_ROW_COUNT;
        }
        if self.spin_lock_timeout_ms == 0 {
            self.spin_lock_timeout_ms = DEFAULT_SPIN_LOCK_TIMEOUT_MS;
        }
        self
    }

    pub fn spin_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.spin_lock_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_reasonable() {
        let cfg = WalConfig::default();
        assert!(cfg.data_append_page_size.is_power_of_two());
        assert!(cfg.data_append_page_size >= PAGE_SIZE_MIN_LIMIT);
        assert!(cfg.segment_rollover_row_count > 0);
    }

    #[test]
    fn normalized_clamps_page_size() {
        let cfg = WalConfig {
            data_append_page_size: 100_000,
            ..WalConfig::default()
        }
        .normalized();
        assert_eq!(cfg.data_append_page_size, 128 * 1024);

        // An exact midpoint rounds up so growth never undershoots.
        let cfg = WalConfig {
            data_append_page_size: 96 * 1024,
            ..WalConfig::default()
        }
        .normalized();
        assert_eq!(cfg.data_append_page_size, 128 * 1024);

        // Out-of-window requests clamp to the window edges.
        let cfg = WalConfig {
            data_append_page_size: 1,
            ..WalConfig::default()
        }
        .normalized();
        assert_eq!(cfg.data_append_page_size, 64 * 1024);

        let cfg = WalConfig {
            data_append_page_size: 0,
            segment_rollover_row_count: 0,
            ..WalConfig::default()
        }
        .normalized();
        assert_eq!(cfg.data_append_page_size, DEFAULT_DATA_APPEND_PAGE_SIZE);
        assert_eq!(
            cfg.segment_rollover_row_count,
            DEFAULT_SEGMENT_ROLLOVER_ROW_COUNT
        );
    }

    #[test]
    fn serde_round_trip() {
        let cfg = WalConfig::default();
        let json = serde_json::to_string(&cfg).expect("serialize");
        let decoded: WalConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(cfg, decoded);
    }

    #[test]
    fn segment_id_next() {
        assert_eq!(SegmentId::new(1), SegmentId::new(0).next());
        assert_eq!("7", SegmentId::new(7).to_string());
    }
}
