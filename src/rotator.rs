//! Rotating file store with crash-safe in-place rewrites.
//!
//! A rotator manages one directory of files sharing a well-known prefix.
//! A single "active" file accepts rewrites until it is old enough to be
//! sealed into a historical file; sealed files are deleted once they age
//! past the retention window. Instead of touching files directly, callers
//! implement stream visitors ([`StreamReader`], [`StreamWriter`],
//! [`Rewriter`]) that the rotator drives through an atomic
//! read-modify-write protocol.
//!
//! During a rewrite exactly one sidecar exists next to the target:
//! `<name>.backup` preserves the prior content, or the empty marker
//! `<name>.no_backup` records that no prior file existed. A sidecar found
//! at construction time means a rewrite was interrupted; recovery restores
//! the prior committed state. Not thread safe.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::name::{self, Span};
use crate::Result;

const SUFFIX_BACKUP: &str = ".backup";
const SUFFIX_NO_BACKUP: &str = ".no_backup";

/// Consumes existing file content. May be called once per matching file
/// when reading rotated history.
pub trait StreamReader {
    fn read(&mut self, src: &mut dyn Read) -> Result<()>;
}

/// Produces replacement file content.
pub trait StreamWriter {
    fn write(&mut self, dst: &mut dyn Write) -> Result<()>;
}

/// Read-modify-write transformer driven by the rotator. For each file the
/// call order is strict: `reset`, `read` (when the file exists),
/// `should_write`, `write`. The gate is not consulted for files that do
/// not exist yet; a missing target is always a candidate for creation.
pub trait Rewriter: StreamReader + StreamWriter {
    fn reset(&mut self);
    fn should_write(&self) -> bool;
}

/// Rotates files over time, similar to `logrotate`. Callers must invoke
/// [`FileRotator::maybe_rotate`] periodically to drive actual rotation.
pub struct FileRotator {
    base_path: PathBuf,
    prefix: String,
    rotate_age_millis: i64,
    delete_age_millis: i64,
}

impl FileRotator {
    /// Open a rotator over `base_path`, creating the directory if needed
    /// and recovering any rewrite interrupted by a crash.
    pub fn new(
        base_path: impl Into<PathBuf>,
        prefix: impl Into<String>,
        rotate_age_millis: i64,
        delete_age_millis: i64,
    ) -> Result<Self> {
        let rotator = Self {
            base_path: base_path.into(),
            prefix: prefix.into(),
            rotate_age_millis,
            delete_age_millis,
        };
        fs::create_dir_all(&rotator.base_path)?;
        rotator.recover()?;
        Ok(rotator)
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Resolve sidecars left behind by an interrupted rewrite. A backup
    /// holds the prior committed content and is renamed over whatever
    /// partial write happened; a no-backup marker means the target did not
    /// exist before, so both marker and partial target are deleted.
    /// Idempotent.
    fn recover(&self) -> Result<()> {
        for entry in self.list()? {
            if !entry.starts_with(&self.prefix) {
                continue;
            }

            if let Some(base) = entry.strip_suffix(SUFFIX_BACKUP) {
                log::debug!("recovering {entry}");
                fs::rename(self.base_path.join(&entry), self.base_path.join(base))?;
            } else if let Some(base) = entry.strip_suffix(SUFFIX_NO_BACKUP) {
                log::debug!("recovering {entry}");
                fs::remove_file(self.base_path.join(&entry))?;
                remove_if_exists(&self.base_path.join(base))?;
            }
        }
        Ok(())
    }

    /// Delete all files managed by this rotator. Per-entry failures are
    /// best-effort; a listing failure is fatal.
    pub fn delete_all(&self) -> Result<()> {
        for entry in self.list()? {
            if name::parse(&self.prefix, &entry).is_none() {
                continue;
            }
            let _ = fs::remove_file(self.base_path.join(&entry));
        }
        Ok(())
    }

    /// Rewrite the currently active file, which need not exist yet. Reads
    /// any existing content first, then writes modified data under backup
    /// protection.
    pub fn rewrite_active(
        &self,
        rewriter: &mut dyn Rewriter,
        current_time_millis: i64,
    ) -> Result<()> {
        let active = self.active_name(current_time_millis)?;
        self.rewrite_single(rewriter, &active)
    }

    /// Rewrite every managed file, usually to transform historical data.
    /// Each file is processed atomically; visitation order is unspecified.
    pub fn rewrite_all(&self, rewriter: &mut dyn Rewriter) -> Result<()> {
        for entry in self.list()? {
            if name::parse(&self.prefix, &entry).is_none() {
                continue;
            }
            self.rewrite_single(rewriter, &entry)?;
        }
        Ok(())
    }

    fn rewrite_single(&self, rewriter: &mut dyn Rewriter, name: &str) -> Result<()> {
        log::debug!("rewriting {name}");

        let path = self.base_path.join(name);
        rewriter.reset();

        if path.exists() {
            read_file(&path, rewriter)?;

            // skip when rewriter has nothing to write
            if !rewriter.should_write() {
                return Ok(());
            }

            // keep existing data in a backup during the write
            let backup = self.base_path.join(format!("{name}{SUFFIX_BACKUP}"));
            fs::rename(&path, &backup)?;

            match write_file(&path, rewriter) {
                Ok(()) => {
                    fs::remove_file(&backup)?;
                    Ok(())
                }
                Err(err) => {
                    let _ = fs::remove_file(&path);
                    let _ = fs::rename(&backup, &path);
                    Err(err)
                }
            }
        } else {
            // mark that no prior content existed
            let marker = self.base_path.join(format!("{name}{SUFFIX_NO_BACKUP}"));
            File::create(&marker)?;

            match write_file(&path, rewriter) {
                Ok(()) => {
                    fs::remove_file(&marker)?;
                    Ok(())
                }
                Err(err) => {
                    let _ = fs::remove_file(&path);
                    let _ = fs::remove_file(&marker);
                    Err(err)
                }
            }
        }
    }

    /// Stream every managed file whose range intersects the closed
    /// interval `[match_start_millis, match_end_millis]` into `reader`.
    /// Visitation order is unspecified; readers must be commutative.
    pub fn read_matching(
        &self,
        reader: &mut dyn StreamReader,
        match_start_millis: i64,
        match_end_millis: i64,
    ) -> Result<()> {
        for entry in self.list()? {
            let Some(span) = name::parse(&self.prefix, &entry) else {
                continue;
            };
            if span.overlaps(match_start_millis, match_end_millis) {
                log::debug!("reading matching {entry}");
                read_file(&self.base_path.join(&entry), reader)?;
            }
        }
        Ok(())
    }

    /// Name of the currently active file: the oldest active file whose
    /// start precedes `current_time_millis`, or a fresh name starting now.
    fn active_name(&self, current_time_millis: i64) -> Result<String> {
        let mut oldest: Option<(String, i64)> = None;

        for entry in self.list()? {
            let Some(span) = name::parse(&self.prefix, &entry) else {
                continue;
            };
            if !span.is_active() || span.start_millis >= current_time_millis {
                continue;
            }
            match &oldest {
                Some((_, start)) if *start <= span.start_millis => {}
                _ => oldest = Some((entry, span.start_millis)),
            }
        }

        Ok(match oldest {
            Some((entry, _)) => entry,
            None => name::build(&self.prefix, Span::active(current_time_millis)),
        })
    }

    /// Seal active files past the rotation age and delete sealed files
    /// past the retention age. Per-entry failures are best-effort; a
    /// listing failure is fatal.
    pub fn maybe_rotate(&self, current_time_millis: i64) -> Result<()> {
        let rotate_before = current_time_millis.saturating_sub(self.rotate_age_millis);
        let delete_before = current_time_millis.saturating_sub(self.delete_age_millis);

        for entry in self.list()? {
            let Some(span) = name::parse(&self.prefix, &entry) else {
                continue;
            };

            if span.is_active() {
                if span.start_millis <= rotate_before {
                    log::debug!("rotating {entry}");
                    let sealed = name::build(
                        &self.prefix,
                        Span::sealed(span.start_millis, current_time_millis),
                    );
                    let _ = fs::rename(self.base_path.join(&entry), self.base_path.join(sealed));
                }
            } else if span.end_millis <= delete_before {
                log::debug!("deleting {entry}");
                let _ = fs::remove_file(self.base_path.join(&entry));
            }
        }
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.base_path)? {
            let entry = entry?;
            if let Some(entry_name) = entry.file_name().to_str() {
                entries.push(entry_name.to_string());
            }
        }
        Ok(entries)
    }
}

fn read_file<R: StreamReader + ?Sized>(path: &Path, reader: &mut R) -> Result<()> {
    let file = File::open(path)?;
    let mut src = BufReader::new(file);
    reader.read(&mut src)
}

fn write_file<W: StreamWriter + ?Sized>(path: &Path, writer: &mut W) -> Result<()> {
    let file = File::create(path)?;
    let mut dst = BufWriter::new(file);
    writer.write(&mut dst)?;
    // move user-space buffers into the kernel, then push them to disk
    dst.flush()?;
    dst.get_ref().sync_all()?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
