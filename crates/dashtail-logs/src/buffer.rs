use std::cmp::Ordering;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::trace;

use dashtail_types::{LogLevel, LogRecord, RecordKey};

/// Shared handle to a buffered record
pub type ArcLogRecord = Arc<LogRecord>;

/// Default maximum number of retained records
pub const DEFAULT_MAX_RECORDS: usize = 2000;

/// How long a newly arrived record counts as recent
pub const RECENT_WINDOW: Duration = Duration::from_millis(2500);

struct BufferedRecord {
    /// Arrival sequence number
    seq: u64,
    key: RecordKey,
    record: ArcLogRecord,
    /// Timestamp in nanoseconds, `None` if unparsable
    sort_key: Option<i128>,
    /// Set for records that arrived live, `None` for seeded ones
    arrived_at: Option<Instant>,
}

struct BufferInner {
    /// Records in arrival order
    entries: VecDeque<BufferedRecord>,
    /// Keys of exactly the records in `entries`
    seen: HashSet<RecordKey>,
    /// Highest record timestamp seen, whole seconds
    last_seen: Option<i64>,
    next_seq: u64,
}

/// Deduplicating, bounded buffer of log records
///
/// Clones share the same storage, so a session can write while the rendering
/// layer holds a read view.
#[derive(Clone)]
pub struct LogBuffer {
    inner: Arc<RwLock<BufferInner>>,

    /// Maximum capacity
    capacity: usize,
}

impl LogBuffer {
    /// Create a new log buffer with the given capacity
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(RwLock::new(BufferInner {
                entries: VecDeque::with_capacity(capacity + 1),
                seen: HashSet::with_capacity(capacity + 1),
                last_seen: None,
                next_seq: 0,
            })),
            capacity,
        }
    }

    /// Add a live record; returns `false` if it was already present
    pub fn accept(&self, record: LogRecord) -> bool {
        self.insert(record, Some(Instant::now()))
    }

    /// Add records from a one-shot query without marking them recent
    ///
    /// Returns how many were new.
    pub fn seed<I>(&self, records: I) -> usize
    where
        I: IntoIterator<Item = LogRecord>,
    {
        records
            .into_iter()
            .map(|r| self.insert(r, None))
            .filter(|added| *added)
            .count()
    }

    fn insert(&self, record: LogRecord, arrived_at: Option<Instant>) -> bool {
        let key = record.key();
        let mut inner = self.inner.write();
        if inner.seen.contains(&key) {
            trace!(key = key.as_str(), "accept: duplicate");
            return false;
        }

        let parsed = record.parsed_timestamp();
        if let Some(ts) = parsed {
            let secs = ts.timestamp();
            inner.last_seen = Some(inner.last_seen.map_or(secs, |prev| prev.max(secs)));
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.seen.insert(key.clone());
        inner.entries.push_back(BufferedRecord {
            seq,
            key,
            record: Arc::new(record),
            sort_key: parsed.map(|ts| {
                i128::from(ts.timestamp()) * 1_000_000_000 + i128::from(ts.timestamp_subsec_nanos())
            }),
            arrived_at,
        });

        if inner.entries.len() > self.capacity {
            Self::evict_locked(&mut inner, self.capacity);
        }
        true
    }

    /// Keep the `capacity` most recent records, preserving arrival order
    fn evict_locked(inner: &mut BufferInner, capacity: usize) {
        let mut ranked: Vec<&BufferedRecord> = inner.entries.iter().collect();
        ranked.sort_by(|a, b| rank_newest_first(a, b));
        let keep: HashSet<u64> = ranked.iter().take(capacity).map(|e| e.seq).collect();

        let before = inner.entries.len();
        inner.entries.retain(|e| keep.contains(&e.seq));
        inner.seen = inner.entries.iter().map(|e| e.key.clone()).collect();
        trace!(evicted = before - inner.entries.len(), "evict: trimmed buffer");
    }

    /// Whether a record with the same identity is buffered
    pub fn contains(&self, record: &LogRecord) -> bool {
        self.inner.read().seen.contains(&record.key())
    }

    /// Get all records in arrival order
    pub fn all(&self) -> Vec<ArcLogRecord> {
        self.inner
            .read()
            .entries
            .iter()
            .map(|e| Arc::clone(&e.record))
            .collect()
    }

    /// Records ordered for display: newest timestamp first
    ///
    /// Unparsable timestamps come last; ties keep arrival order.
    pub fn newest_first(&self) -> Vec<ArcLogRecord> {
        let inner = self.inner.read();
        let mut ranked: Vec<&BufferedRecord> = inner.entries.iter().collect();
        ranked.sort_by(|a, b| rank_newest_first(a, b));
        ranked.into_iter().map(|e| Arc::clone(&e.record)).collect()
    }

    /// Whether the record arrived live within the highlight window
    pub fn is_recent(&self, record: &LogRecord) -> bool {
        let key = record.key();
        let now = Instant::now();
        self.inner
            .read()
            .entries
            .iter()
            .any(|e| e.key == key && is_within_window(e.arrived_at, now))
    }

    /// Records still inside the highlight window, in arrival order
    pub fn recent(&self) -> Vec<ArcLogRecord> {
        let now = Instant::now();
        self.inner
            .read()
            .entries
            .iter()
            .filter(|e| is_within_window(e.arrived_at, now))
            .map(|e| Arc::clone(&e.record))
            .collect()
    }

    /// Highest record timestamp seen, in whole unix seconds
    pub fn last_seen_timestamp(&self) -> Option<i64> {
        self.inner.read().last_seen
    }

    /// Get record count per log level
    pub fn level_counts(&self) -> LevelCounts {
        let inner = self.inner.read();
        let mut counts = LevelCounts::default();

        for entry in inner.entries.iter() {
            match entry.record.log_level() {
                LogLevel::Trace => counts.trace += 1,
                LogLevel::Debug => counts.debug += 1,
                LogLevel::Info => counts.info += 1,
                LogLevel::Warn => counts.warn += 1,
                LogLevel::Error => counts.error += 1,
                LogLevel::Fatal => counts.fatal += 1,
                LogLevel::Unknown => counts.unknown += 1,
            }
        }

        counts
    }

    /// Total record count
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// Check if buffer is empty
    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    /// Number of identities in the dedup set
    pub fn seen_len(&self) -> usize {
        self.inner.read().seen.len()
    }

    /// Clear all records, identities and the last seen timestamp
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.entries.clear();
        inner.seen.clear();
        inner.last_seen = None;
        inner.next_seq = 0;
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECORDS)
    }
}

fn rank_newest_first(a: &BufferedRecord, b: &BufferedRecord) -> Ordering {
    match (a.sort_key, b.sort_key) {
        (Some(x), Some(y)) => y.cmp(&x).then(a.seq.cmp(&b.seq)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.seq.cmp(&b.seq),
    }
}

fn is_within_window(arrived_at: Option<Instant>, now: Instant) -> bool {
    arrived_at.is_some_and(|t| now.duration_since(t) < RECENT_WINDOW)
}

/// Counts per log level
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LevelCounts {
    pub trace: usize,
    pub debug: usize,
    pub info: usize,
    pub warn: usize,
    pub error: usize,
    pub fatal: usize,
    pub unknown: usize,
}

impl LevelCounts {
    pub fn total(&self) -> usize {
        self.trace + self.debug + self.info + self.warn + self.error + self.fatal + self.unknown
    }
}
