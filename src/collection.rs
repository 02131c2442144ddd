//! Multidimensional counter history keyed by identity, uid, set and tag.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;

use crate::history::{Counters, History};
use crate::rotator::{StreamReader, StreamWriter};
use crate::snapshot::{SetKind, TAG_NONE, UID_ALL};
use crate::wire;
use crate::{Error, Result};

const MAGIC: u32 = u32::from_le_bytes(*b"MTRC");
const VERSION: u16 = 1;

const LEGACY_MAGIC: u32 = u32::from_le_bytes(*b"MTRL");
const LEGACY_VERSION: u16 = 0;

/// One network an interface was attached to while counters accumulated.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Identity {
    pub kind: u32,
    pub scope: Option<String>,
    pub roaming: bool,
}

impl Identity {
    pub fn new(kind: u32) -> Self {
        Self {
            kind,
            scope: None,
            roaming: false,
        }
    }
}

/// Set of identities an interface resolved to. Ordered so it can serve as
/// part of a map key and serialize deterministically.
pub type IdentitySet = BTreeSet<Identity>;

/// Full key a history is recorded under.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Key {
    pub ident: IdentitySet,
    pub uid: u32,
    pub set: SetKind,
    pub tag: u32,
}

/// Predicate over keys used by summary queries. Unset fields match
/// anything; identity fields match when any member of the set matches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Template {
    pub kind: Option<u32>,
    pub scope: Option<String>,
    pub uid: Option<u32>,
}

impl Template {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn for_uid(uid: u32) -> Self {
        Self {
            uid: Some(uid),
            ..Self::default()
        }
    }

    pub fn matches(&self, key: &Key) -> bool {
        if let Some(uid) = self.uid {
            if key.uid != uid {
                return false;
            }
        }
        if self.kind.is_none() && self.scope.is_none() {
            return true;
        }
        key.ident.iter().any(|ident| {
            self.kind.map_or(true, |kind| ident.kind == kind)
                && self
                    .scope
                    .as_deref()
                    .map_or(true, |scope| ident.scope.as_deref() == Some(scope))
        })
    }
}

/// In-memory collection of bucketed histories. Streams fold into the
/// collection on read, so reading several rotated files accumulates their
/// union; the dirty flag tracks whether anything was recorded since the
/// last [`StatsCollection::clear_dirty`].
#[derive(Debug, Clone)]
pub struct StatsCollection {
    bucket_duration: i64,
    entries: BTreeMap<Key, History>,
    total_bytes: i64,
    dirty: bool,
}

impl StatsCollection {
    pub fn new(bucket_duration: i64) -> Self {
        Self {
            bucket_duration,
            entries: BTreeMap::new(),
            total_bytes: 0,
            dirty: false,
        }
    }

    pub fn bucket_duration(&self) -> i64 {
        self.bucket_duration
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// Total bytes recorded across all histories, maintained incrementally
    /// as the persistence-threshold signal.
    pub fn total_bytes(&self) -> i64 {
        self.total_bytes
    }

    /// Earliest bucket start across all histories, or `i64::MAX`.
    pub fn start_millis(&self) -> i64 {
        self.entries
            .values()
            .map(|history| history.start_millis())
            .min()
            .unwrap_or(i64::MAX)
    }

    /// Latest bucket end across all histories, or `i64::MIN`.
    pub fn end_millis(&self) -> i64 {
        self.entries
            .values()
            .map(|history| history.end_millis())
            .max()
            .unwrap_or(i64::MIN)
    }

    /// Drop all recorded data.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.total_bytes = 0;
        self.dirty = false;
    }

    /// Record counters for the given key over `[start_millis, end_millis)`.
    pub fn record_data(
        &mut self,
        ident: &IdentitySet,
        uid: u32,
        set: SetKind,
        tag: u32,
        start_millis: i64,
        end_millis: i64,
        counters: Counters,
    ) {
        let key = Key {
            ident: ident.clone(),
            uid,
            set,
            tag,
        };
        self.entries
            .entry(key)
            .or_insert_with(|| History::new(self.bucket_duration))
            .record(start_millis, end_millis, counters);
        self.total_bytes += counters.total_bytes();
        self.dirty = true;
    }

    /// Fold a whole history under the given key.
    pub fn record_history(&mut self, key: &Key, history: &History) {
        self.entries
            .entry(key.clone())
            .or_insert_with(|| History::new(self.bucket_duration))
            .record_history(history);
        self.total_bytes += history.total_bytes();
        self.dirty = true;
    }

    /// Fold every history of `other` into this collection.
    pub fn record_collection(&mut self, other: &StatsCollection) {
        for (key, history) in &other.entries {
            self.record_history(key, history);
        }
    }

    /// Drop every history recorded under `uid`. Marks the collection dirty
    /// only when something was actually removed.
    pub fn remove_uid(&mut self, uid: u32) {
        let removed: Vec<Key> = self
            .entries
            .keys()
            .filter(|key| key.uid == uid)
            .cloned()
            .collect();
        for key in removed {
            if let Some(history) = self.entries.remove(&key) {
                self.total_bytes -= history.total_bytes();
                self.dirty = true;
            }
        }
    }

    /// Sum counters over `[from_millis, to_millis]` for keys matching the
    /// template.
    pub fn summarize(&self, template: &Template, from_millis: i64, to_millis: i64) -> Counters {
        let mut totals = Counters::default();
        for (key, history) in &self.entries {
            if template.matches(key) {
                totals += history.summarize(from_millis, to_millis);
            }
        }
        totals
    }

    /// Fold serialized histories from `src` into this collection.
    pub fn read(&mut self, src: &mut dyn Read) -> Result<()> {
        let mut buf = Vec::new();
        src.read_to_end(&mut buf)?;
        if buf.len() < 10 {
            return Err(Error::Corrupt("collection truncated"));
        }

        let (body, trailer) = buf.split_at(buf.len() - 4);
        let expected = u32::from_le_bytes(trailer.try_into().expect("slice length"));
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(body);
        if hasher.finalize() != expected {
            return Err(Error::Corrupt("collection crc mismatch"));
        }

        let mut cursor: &[u8] = body;
        let magic = wire::read_u32(&mut cursor)?;
        if magic != MAGIC {
            return Err(Error::Corrupt("bad collection magic"));
        }
        let version = wire::read_u16(&mut cursor)?;
        if version != VERSION {
            return Err(Error::UnsupportedVersion(version));
        }

        let count = wire::read_u32(&mut cursor)?;
        for _ in 0..count {
            let key = read_key(&mut cursor)?;
            let history = History::read(&mut cursor)?;
            self.record_history(&key, &history);
        }
        if !cursor.is_empty() {
            return Err(Error::Corrupt("trailing bytes after collection"));
        }
        Ok(())
    }

    /// Serialize all histories to `dst`.
    pub fn write(&self, dst: &mut dyn Write) -> Result<()> {
        let mut body = Vec::new();
        wire::write_u32(&mut body, MAGIC)?;
        wire::write_u16(&mut body, VERSION)?;
        wire::write_u32(&mut body, self.entries.len() as u32)?;
        for (key, history) in &self.entries {
            write_key(&mut body, key)?;
            history.write(&mut body)?;
        }

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&body);
        let crc = hasher.finalize();

        dst.write_all(&body)?;
        dst.write_all(&crc.to_le_bytes())?;
        Ok(())
    }

    /// Fold a legacy single-file journal of summary records, ignoring
    /// per-uid attribution.
    pub fn read_legacy_network(&mut self, path: &Path) -> Result<()> {
        for record in read_legacy_records(path)? {
            let mut ident = IdentitySet::new();
            ident.insert(record.identity);
            self.record_data(
                &ident,
                UID_ALL,
                SetKind::Default,
                TAG_NONE,
                record.start_millis,
                record.end_millis,
                record.counters,
            );
        }
        Ok(())
    }

    /// Fold a legacy single-file journal of per-uid records, keeping only
    /// the requested tag class.
    pub fn read_legacy_uid(&mut self, path: &Path, only_tags: bool) -> Result<()> {
        for record in read_legacy_records(path)? {
            if (record.tag == TAG_NONE) == only_tags {
                continue;
            }
            let mut ident = IdentitySet::new();
            ident.insert(record.identity);
            self.record_data(
                &ident,
                record.uid,
                record.set,
                record.tag,
                record.start_millis,
                record.end_millis,
                record.counters,
            );
        }
        Ok(())
    }
}

impl StreamReader for StatsCollection {
    fn read(&mut self, src: &mut dyn Read) -> Result<()> {
        StatsCollection::read(self, src)
    }
}

impl StreamWriter for StatsCollection {
    fn write(&mut self, dst: &mut dyn Write) -> Result<()> {
        StatsCollection::write(self, dst)
    }
}

fn write_key(dst: &mut dyn Write, key: &Key) -> Result<()> {
    wire::write_u32(dst, key.ident.len() as u32)?;
    for ident in &key.ident {
        wire::write_u32(dst, ident.kind)?;
        match &ident.scope {
            Some(scope) => {
                wire::write_u32(dst, scope.len() as u32)?;
                dst.write_all(scope.as_bytes())?;
            }
            None => wire::write_u32(dst, u32::MAX)?,
        }
        wire::write_u8(dst, ident.roaming as u8)?;
    }
    wire::write_u32(dst, key.uid)?;
    wire::write_u8(dst, key.set.to_wire())?;
    wire::write_u32(dst, key.tag)?;
    Ok(())
}

fn read_key(src: &mut dyn Read) -> Result<Key> {
    let member_count = wire::read_u32(src)?;
    let mut ident = IdentitySet::new();
    for _ in 0..member_count {
        let kind = wire::read_u32(src)?;
        let scope_len = wire::read_u32(src)?;
        let scope = if scope_len == u32::MAX {
            None
        } else {
            let mut bytes = vec![0u8; scope_len as usize];
            src.read_exact(&mut bytes)?;
            Some(
                String::from_utf8(bytes)
                    .map_err(|_| Error::Corrupt("identity scope not utf-8"))?,
            )
        };
        let roaming = match wire::read_u8(src)? {
            0 => false,
            1 => true,
            _ => return Err(Error::Corrupt("bad roaming flag")),
        };
        ident.insert(Identity {
            kind,
            scope,
            roaming,
        });
    }

    let uid = wire::read_u32(src)?;
    let set = SetKind::from_wire(wire::read_u8(src)?)
        .ok_or(Error::Corrupt("bad set kind"))?;
    let tag = wire::read_u32(src)?;

    Ok(Key {
        ident,
        uid,
        set,
        tag,
    })
}

struct LegacyRecord {
    identity: Identity,
    uid: u32,
    set: SetKind,
    tag: u32,
    start_millis: i64,
    end_millis: i64,
    counters: Counters,
}

fn read_legacy_records(path: &Path) -> Result<Vec<LegacyRecord>> {
    let file = File::open(path)?;
    let mut src = BufReader::new(file);
    let src: &mut dyn Read = &mut src;

    let magic = wire::read_u32(src)?;
    if magic != LEGACY_MAGIC {
        return Err(Error::Corrupt("bad legacy magic"));
    }
    let version = wire::read_u16(src)?;
    if version != LEGACY_VERSION {
        return Err(Error::UnsupportedVersion(version));
    }

    let count = wire::read_u32(src)?;
    let mut records = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        let kind = wire::read_u32(src)?;
        let scope_len = wire::read_u32(src)?;
        let scope = if scope_len == u32::MAX {
            None
        } else {
            let mut bytes = vec![0u8; scope_len as usize];
            src.read_exact(&mut bytes)?;
            Some(
                String::from_utf8(bytes)
                    .map_err(|_| Error::Corrupt("identity scope not utf-8"))?,
            )
        };
        let roaming = wire::read_u8(src)? != 0;
        let uid = wire::read_u32(src)?;
        let set = SetKind::from_wire(wire::read_u8(src)?)
            .ok_or(Error::Corrupt("bad set kind"))?;
        let tag = wire::read_u32(src)?;
        let start_millis = wire::read_i64(src)?;
        let end_millis = wire::read_i64(src)?;
        let counters = Counters {
            rx_bytes: wire::read_i64(src)?,
            rx_packets: wire::read_i64(src)?,
            tx_bytes: wire::read_i64(src)?,
            tx_packets: wire::read_i64(src)?,
            operations: wire::read_i64(src)?,
        };

        records.push(LegacyRecord {
            identity: Identity {
                kind,
                scope,
                roaming,
            },
            uid,
            set,
            tag,
            start_millis,
            end_millis,
            counters,
        });
    }

    Ok(records)
}
