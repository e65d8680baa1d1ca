//! Bounded on-disk retention.
//!
//! `prune` keeps the `keep` most recently created artifacts of one kind in a
//! directory and deletes the rest, oldest first. Creation time comes from
//! the `ArtifactStamp` embedded in the entry name; entries written by
//! something else fall back to filesystem metadata.
//!
//! Sweeps take no lock. Two sweeps of the same directory must not overlap;
//! the capture API serialises them by handling one request at a time.

use anyhow::{Context, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::artifact::ArtifactStamp;

/// Default retention window.
pub const DEFAULT_KEEP: usize = 5;

/// Which entries of a directory form its retention set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArtifactKind {
    /// Flat files (screenshots).
    Files,
    /// One sub-directory per source image (detection crops).
    Directories,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetainedEntry {
    pub path: PathBuf,
    pub created: ArtifactStamp,
}

/// Entries of one kind in one directory, oldest first.
#[derive(Clone, Debug)]
pub struct RetentionSet {
    entries: Vec<RetainedEntry>,
}

impl RetentionSet {
    /// List `dir`. A missing directory is an empty set.
    pub fn scan(dir: &Path, kind: ArtifactKind) -> Result<Self> {
        let read_dir = match fs::read_dir(dir) {
            Ok(read_dir) => read_dir,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Ok(Self {
                    entries: Vec::new(),
                })
            }
            Err(err) => {
                return Err(err).with_context(|| format!("list {}", dir.display()));
            }
        };

        let mut entries = Vec::new();
        for entry in read_dir {
            let entry = entry.with_context(|| format!("list {}", dir.display()))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') {
                continue;
            }
            // Entries deleted between listing and inspection are skipped.
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            let matches_kind = match kind {
                ArtifactKind::Files => file_type.is_file(),
                ArtifactKind::Directories => file_type.is_dir(),
            };
            if !matches_kind {
                continue;
            }
            let created = match ArtifactStamp::find_in(&name) {
                Some(stamp) => stamp,
                None => match metadata_stamp(&entry.path()) {
                    Some(stamp) => stamp,
                    None => continue,
                },
            };
            entries.push(RetainedEntry {
                path: entry.path(),
                created,
            });
        }

        entries.sort_by(|a, b| {
            a.created
                .cmp(&b.created)
                .then_with(|| a.path.file_name().cmp(&b.path.file_name()))
        });
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Entries outside the `keep` most recent, oldest first.
    pub fn expired(&self, keep: usize) -> &[RetainedEntry] {
        let cut = self.entries.len().saturating_sub(keep);
        &self.entries[..cut]
    }
}

/// Delete all but the `keep` most recent entries of `kind` under `dir`.
///
/// Returns the number of entries removed. Entries that vanish concurrently
/// count as removed.
pub fn prune(dir: &Path, kind: ArtifactKind, keep: usize) -> Result<usize> {
    let set = RetentionSet::scan(dir, kind)?;
    let expired = set.expired(keep);
    for entry in expired {
        remove_entry(&entry.path, kind)?;
    }
    if !expired.is_empty() {
        log::info!(
            "retention: removed {} of {} entries under {} (keep {})",
            expired.len(),
            set.len(),
            dir.display(),
            keep
        );
    }
    Ok(expired.len())
}

fn remove_entry(path: &Path, kind: ArtifactKind) -> Result<()> {
    match kind {
        ArtifactKind::Files => ignore_missing(fs::remove_file(path))
            .with_context(|| format!("remove {}", path.display())),
        ArtifactKind::Directories => {
            let children = match fs::read_dir(path) {
                Ok(children) => children,
                Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
                Err(err) => {
                    return Err(err).with_context(|| format!("list {}", path.display()));
                }
            };
            for child in children {
                let child = child.with_context(|| format!("list {}", path.display()))?;
                let child_path = child.path();
                let removed = match child.file_type() {
                    Ok(file_type) if file_type.is_dir() => fs::remove_dir_all(&child_path),
                    _ => fs::remove_file(&child_path),
                };
                ignore_missing(removed)
                    .with_context(|| format!("remove {}", child_path.display()))?;
            }
            ignore_missing(fs::remove_dir(path))
                .with_context(|| format!("remove {}", path.display()))
        }
    }
}

fn ignore_missing(result: std::io::Result<()>) -> std::io::Result<()> {
    match result {
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn metadata_stamp(path: &Path) -> Option<ArtifactStamp> {
    let metadata = fs::metadata(path).ok()?;
    let time = metadata.created().or_else(|_| metadata.modified()).ok()?;
    Some(ArtifactStamp::from_system_time(time))
}
