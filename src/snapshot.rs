//! Cumulative counter snapshots and delta computation.

use crate::history::Counters;

/// Tag value carried by entries that were not explicitly tagged.
pub const TAG_NONE: u32 = 0;

/// Wildcard uid used by summary records that are not attributed to a
/// single uid, such as imported legacy network totals.
pub const UID_ALL: u32 = u32::MAX;

/// Activity class an entry was counted under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SetKind {
    Default,
    Foreground,
}

impl SetKind {
    pub(crate) fn to_wire(self) -> u8 {
        match self {
            SetKind::Default => 0,
            SetKind::Foreground => 1,
        }
    }

    pub(crate) fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(SetKind::Default),
            1 => Some(SetKind::Foreground),
            _ => None,
        }
    }
}

/// One counter tuple within a snapshot, attributed to an interface, uid,
/// set and tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub iface: String,
    pub uid: u32,
    pub set: SetKind,
    pub tag: u32,
    pub rx_bytes: i64,
    pub rx_packets: i64,
    pub tx_bytes: i64,
    pub tx_packets: i64,
    pub operations: i64,
}

impl Entry {
    pub fn new(iface: impl Into<String>, uid: u32, set: SetKind, tag: u32) -> Self {
        Self {
            iface: iface.into(),
            uid,
            set,
            tag,
            rx_bytes: 0,
            rx_packets: 0,
            tx_bytes: 0,
            tx_packets: 0,
            operations: 0,
        }
    }

    /// True when no counter moved.
    pub fn is_empty(&self) -> bool {
        self.rx_bytes == 0
            && self.rx_packets == 0
            && self.tx_bytes == 0
            && self.tx_packets == 0
            && self.operations == 0
    }

    pub fn counters(&self) -> Counters {
        Counters {
            rx_bytes: self.rx_bytes,
            rx_packets: self.rx_packets,
            tx_bytes: self.tx_bytes,
            tx_packets: self.tx_packets,
            operations: self.operations,
        }
    }

    fn key(&self) -> (&str, u32, SetKind, u32) {
        (&self.iface, self.uid, self.set, self.tag)
    }
}

/// Observer for counters that moved backwards between two snapshots.
/// Invoked synchronously during subtraction; advisory only, the delta is
/// clamped regardless.
pub trait NonMonotonicObserver {
    fn found_non_monotonic(&mut self, cookie: &str, entry: &Entry);
}

/// Observer that ignores all reports.
#[derive(Debug, Default, Clone, Copy)]
pub struct IgnoringObserver;

impl NonMonotonicObserver for IgnoringObserver {
    fn found_non_monotonic(&mut self, _cookie: &str, _entry: &Entry) {}
}

/// A set of cumulative counters sampled at one instant, along with the
/// elapsed time the counters accumulated over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    elapsed_millis: i64,
    entries: Vec<Entry>,
}

impl Snapshot {
    pub fn new(elapsed_millis: i64) -> Self {
        Self {
            elapsed_millis,
            entries: Vec::new(),
        }
    }

    pub fn elapsed_millis(&self) -> i64 {
        self.elapsed_millis
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add counters, folding into an existing entry with the same
    /// (iface, uid, set, tag) key.
    pub fn record(&mut self, entry: Entry) {
        match self.find_mut(entry.key()) {
            Some(existing) => {
                existing.rx_bytes += entry.rx_bytes;
                existing.rx_packets += entry.rx_packets;
                existing.tx_bytes += entry.tx_bytes;
                existing.tx_packets += entry.tx_packets;
                existing.operations += entry.operations;
            }
            None => self.entries.push(entry),
        }
    }

    /// Compute `self − older` component-wise. A key missing from `older`
    /// is treated as a zero baseline. Any component that moved backwards
    /// is reported through `observer` once per entry and clamped to zero.
    pub fn subtract(
        &self,
        older: &Snapshot,
        observer: &mut dyn NonMonotonicObserver,
        cookie: &str,
    ) -> Snapshot {
        let mut delta = Snapshot::new(self.elapsed_millis.saturating_sub(older.elapsed_millis).max(0));

        for entry in &self.entries {
            let mut out = entry.clone();
            if let Some(base) = older.find(entry.key()) {
                out.rx_bytes -= base.rx_bytes;
                out.rx_packets -= base.rx_packets;
                out.tx_bytes -= base.tx_bytes;
                out.tx_packets -= base.tx_packets;
                out.operations -= base.operations;
            }

            if out.rx_bytes < 0
                || out.rx_packets < 0
                || out.tx_bytes < 0
                || out.tx_packets < 0
                || out.operations < 0
            {
                observer.found_non_monotonic(cookie, entry);
                out.rx_bytes = out.rx_bytes.max(0);
                out.rx_packets = out.rx_packets.max(0);
                out.tx_bytes = out.tx_bytes.max(0);
                out.tx_packets = out.tx_packets.max(0);
                out.operations = out.operations.max(0);
            }

            delta.entries.push(out);
        }

        delta
    }

    /// Copy of this snapshot with all entries for `uid` removed.
    pub fn without_uid(&self, uid: u32) -> Snapshot {
        Snapshot {
            elapsed_millis: self.elapsed_millis,
            entries: self
                .entries
                .iter()
                .filter(|entry| entry.uid != uid)
                .cloned()
                .collect(),
        }
    }

    fn find(&self, key: (&str, u32, SetKind, u32)) -> Option<&Entry> {
        self.entries.iter().find(|entry| entry.key() == key)
    }

    fn find_mut(&mut self, key: (&str, u32, SetKind, u32)) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|entry| entry.key() == key)
    }
}
