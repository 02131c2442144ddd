//! Records deltas between periodic counter snapshots into bucketed
//! history, persisting through a [`FileRotator`] once pending data grows
//! past a byte threshold. Not thread safe.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::path::Path;
use std::rc::{Rc, Weak};

use crate::collection::{IdentitySet, StatsCollection, Template};
use crate::history::Counters;
use crate::rotator::{FileRotator, Rewriter, StreamReader, StreamWriter};
use crate::snapshot::{NonMonotonicObserver, Snapshot, TAG_NONE};
use crate::Result;

/// Recorder tuning knobs.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Opaque label passed with observer callbacks and log lines so a
    /// shared observer can tell recorder instances apart.
    pub cookie: String,
    /// Quantization interval for stored history buckets.
    pub bucket_duration_millis: i64,
    /// Pending bytes beyond which [`SnapshotRecorder::maybe_persist`]
    /// writes to disk.
    pub persist_threshold_bytes: i64,
    /// When true this recorder owns tagged entries; when false, untagged
    /// ones. Each snapshot entry belongs to exactly one class.
    pub only_tags: bool,
}

/// Stateful recorder that turns cumulative snapshots into durable
/// time-series history.
pub struct SnapshotRecorder {
    rotator: FileRotator,
    observer: Box<dyn NonMonotonicObserver>,
    config: RecorderConfig,

    last_snapshot: Option<Snapshot>,
    pending: StatsCollection,
    since_boot: StatsCollection,
    complete: Weak<RefCell<StatsCollection>>,
}

impl SnapshotRecorder {
    pub fn new(
        rotator: FileRotator,
        observer: Box<dyn NonMonotonicObserver>,
        config: RecorderConfig,
    ) -> Self {
        let pending = StatsCollection::new(config.bucket_duration_millis);
        let since_boot = StatsCollection::new(config.bucket_duration_millis);
        Self {
            rotator,
            observer,
            config,
            last_snapshot: None,
            pending,
            since_boot,
            complete: Weak::new(),
        }
    }

    pub fn rotator(&self) -> &FileRotator {
        &self.rotator
    }

    /// Bytes currently pending persistence.
    pub fn pending_bytes(&self) -> i64 {
        self.pending.total_bytes()
    }

    /// Forget all in-memory state. Disk is untouched.
    pub fn reset(&mut self) {
        self.last_snapshot = None;
        self.pending.reset();
        self.since_boot.reset();
        self.complete = Weak::new();
    }

    /// Counters recorded since process start for keys matching the
    /// template, regardless of what has been persisted.
    pub fn total_since_boot(&self, template: &Template) -> Counters {
        self.since_boot.summarize(template, i64::MIN, i64::MAX)
    }

    /// Record the delta since the previous snapshot, resolving interface
    /// names through `iface_identities`. The first snapshot is the
    /// bootstrap baseline and is never itself recorded.
    pub fn record_snapshot(
        &mut self,
        snapshot: Snapshot,
        iface_identities: &HashMap<String, IdentitySet>,
        current_time_millis: i64,
    ) {
        let Some(last) = &self.last_snapshot else {
            self.last_snapshot = Some(snapshot);
            return;
        };

        let complete = self.complete.upgrade();
        let delta = snapshot.subtract(last, self.observer.as_mut(), &self.config.cookie);

        let end = current_time_millis;
        let start = end - delta.elapsed_millis();

        let mut unknown_ifaces = HashSet::new();
        for entry in delta.entries() {
            let Some(ident) = iface_identities.get(&entry.iface) else {
                unknown_ifaces.insert(entry.iface.clone());
                continue;
            };

            if entry.is_empty() {
                continue;
            }

            // each recorder owns exactly one tag class
            if (entry.tag == TAG_NONE) == self.config.only_tags {
                continue;
            }

            let counters = entry.counters();
            self.pending
                .record_data(ident, entry.uid, entry.set, entry.tag, start, end, counters);
            self.since_boot
                .record_data(ident, entry.uid, entry.set, entry.tag, start, end, counters);
            if let Some(complete) = &complete {
                complete.borrow_mut().record_data(
                    ident, entry.uid, entry.set, entry.tag, start, end, counters,
                );
            }
        }

        self.last_snapshot = Some(snapshot);

        if !unknown_ifaces.is_empty() {
            log::warn!(
                "ignoring counters for unknown interfaces {:?} in {}",
                unknown_ifaces,
                self.config.cookie
            );
        }
    }

    /// Persist pending deltas when they exceed the configured threshold;
    /// otherwise only give rotation a chance to run.
    pub fn maybe_persist(&mut self, current_time_millis: i64) {
        if self.pending.total_bytes() >= self.config.persist_threshold_bytes {
            self.force_persist(current_time_millis);
        } else if let Err(err) = self.rotator.maybe_rotate(current_time_millis) {
            log::error!("problem rotating {}: {err}", self.config.cookie);
        }
    }

    /// Fold pending deltas into the active file. Failures are logged and
    /// swallowed; pending data is retained so the next attempt retries.
    pub fn force_persist(&mut self, current_time_millis: i64) {
        if !self.pending.is_dirty() {
            return;
        }

        log::debug!("persisting pending stats for {}", self.config.cookie);
        let result = {
            let mut rewriter = CombiningRewriter::new(&mut self.pending);
            self.rotator.rewrite_active(&mut rewriter, current_time_millis)
        };
        match result {
            Ok(()) => {
                if let Err(err) = self.rotator.maybe_rotate(current_time_millis) {
                    log::error!("problem rotating {}: {err}", self.config.cookie);
                }
                self.pending.reset();
            }
            Err(err) => {
                log::error!(
                    "problem persisting pending stats for {}: {err}",
                    self.config.cookie
                );
            }
        }
    }

    /// Remove the given uid from all persisted history and from the
    /// current baseline snapshot. Failures are logged and swallowed.
    pub fn remove_uid(&mut self, uid: u32) {
        let mut rewriter = RemoveUidRewriter::new(self.config.bucket_duration_millis, uid);
        if let Err(err) = self.rotator.rewrite_all(&mut rewriter) {
            log::error!("problem removing uid {uid} for {}: {err}", self.config.cookie);
        }

        if let Some(last) = self.last_snapshot.take() {
            self.last_snapshot = Some(last.without_uid(uid));
        }
    }

    /// Complete history: everything on disk plus pending deltas. Cached
    /// behind a weak handle; once all strong handles drop, the next call
    /// rebuilds from disk. Future snapshots keep a live handle updated.
    pub fn get_or_load_complete(&mut self) -> Rc<RefCell<StatsCollection>> {
        if let Some(complete) = self.complete.upgrade() {
            return complete;
        }

        log::debug!("loading complete history from disk for {}", self.config.cookie);
        let mut complete = StatsCollection::new(self.config.bucket_duration_millis);
        if let Err(err) = self.rotator.read_matching(&mut complete, i64::MIN, i64::MAX) {
            log::error!(
                "problem reading complete history for {}: {err}",
                self.config.cookie
            );
        }
        complete.record_collection(&self.pending);

        let complete = Rc::new(RefCell::new(complete));
        self.complete = Rc::downgrade(&complete);
        complete
    }

    /// Import a legacy network-summary file, replacing any rotated
    /// history so data is never double counted. Historical files are
    /// created directly at the legacy time range.
    pub fn import_legacy_network(&mut self, path: &Path) -> Result<()> {
        self.rotator.delete_all()?;

        let mut collection = StatsCollection::new(self.config.bucket_duration_millis);
        collection.read_legacy_network(path)?;
        self.import_collection(collection)
    }

    /// Import a legacy per-uid file, keeping only this recorder's tag
    /// class.
    pub fn import_legacy_uid(&mut self, path: &Path) -> Result<()> {
        self.rotator.delete_all()?;

        let mut collection = StatsCollection::new(self.config.bucket_duration_millis);
        collection.read_legacy_uid(path, self.config.only_tags)?;
        self.import_collection(collection)
    }

    fn import_collection(&mut self, mut collection: StatsCollection) -> Result<()> {
        if collection.is_empty() {
            return Ok(());
        }

        // create the active file at the legacy start time, then let the
        // legacy end time drive rotation into a sealed historical file
        let start_millis = collection.start_millis();
        let end_millis = collection.end_millis();

        let mut rewriter = CombiningRewriter::new(&mut collection);
        self.rotator.rewrite_active(&mut rewriter, start_millis)?;
        self.rotator.maybe_rotate(end_millis)?;
        Ok(())
    }
}

/// Rewriter that combines collection contents with anything read from
/// disk and writes the union back, consuming the collection.
pub struct CombiningRewriter<'a> {
    collection: &'a mut StatsCollection,
}

impl<'a> CombiningRewriter<'a> {
    pub fn new(collection: &'a mut StatsCollection) -> Self {
        Self { collection }
    }
}

impl StreamReader for CombiningRewriter<'_> {
    fn read(&mut self, src: &mut dyn Read) -> Result<()> {
        self.collection.read(src)
    }
}

impl StreamWriter for CombiningRewriter<'_> {
    fn write(&mut self, dst: &mut dyn Write) -> Result<()> {
        self.collection.write(dst)?;
        self.collection.reset();
        Ok(())
    }
}

impl Rewriter for CombiningRewriter<'_> {
    fn reset(&mut self) {}

    fn should_write(&self) -> bool {
        true
    }
}

/// Rewriter that strips one uid from each file, writing back only files
/// the removal actually changed.
pub struct RemoveUidRewriter {
    temp: StatsCollection,
    uid: u32,
}

impl RemoveUidRewriter {
    pub fn new(bucket_duration_millis: i64, uid: u32) -> Self {
        Self {
            temp: StatsCollection::new(bucket_duration_millis),
            uid,
        }
    }
}

impl StreamReader for RemoveUidRewriter {
    fn read(&mut self, src: &mut dyn Read) -> Result<()> {
        self.temp.read(src)?;
        // dirty should reflect only whether the removal changed anything
        self.temp.clear_dirty();
        self.temp.remove_uid(self.uid);
        Ok(())
    }
}

impl StreamWriter for RemoveUidRewriter {
    fn write(&mut self, dst: &mut dyn Write) -> Result<()> {
        self.temp.write(dst)
    }
}

impl Rewriter for RemoveUidRewriter {
    fn reset(&mut self) {
        self.temp.reset();
    }

    fn should_write(&self) -> bool {
        self.temp.is_dirty()
    }
}
