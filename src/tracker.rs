//! Server-side tracking of watched files.
//!
//! One record per file under the shared root that passes the include
//! filter. Each record owns the long-lived read handle; the append scan
//! and catch-up downloads share it by offset via `read_at`, so nothing
//! ever seeks. The running SHA-1 covers exactly the delivered prefix and
//! is extended incrementally as the cursor advances; a full recompute
//! happens only on truncation or suspected replacement.

use anyhow::{Context, Result};
use sha1::{Digest, Sha1};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fs::File;
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};

use crate::protocol::{FS_BLOCK, SCAN_BACKOFF_MAX_MS, SCAN_BACKOFF_MIN_MS, STAT_BATCH};
use crate::scanner::{ScanFilter, Scanner};
use crate::wire::{ListEntry, ListUpdate, TOMBSTONE};

pub type SessionId = u64;

/// Running SHA-1 whose context has consumed exactly `hashed` bytes of the
/// file prefix.
struct RunningHash {
    ctx: Sha1,
    hashed: u64,
    hex: String,
}

impl RunningHash {
    fn new() -> Self {
        let ctx = Sha1::new();
        let hex = hex_digest(&ctx);
        RunningHash { ctx, hashed: 0, hex }
    }

    fn feed(&mut self, data: &[u8]) {
        self.ctx.update(data);
        self.hashed += data.len() as u64;
        self.hex = hex_digest(&self.ctx);
    }
}

fn hex_digest(ctx: &Sha1) -> String {
    ctx.clone()
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Hash the first `len` bytes of `file` from scratch.
fn hash_prefix(file: &File, len: u64) -> Result<RunningHash> {
    let mut hash = RunningHash::new();
    extend_hash(file, &mut hash, len)?;
    Ok(hash)
}

/// Feed `hash` the bytes between its current position and `upto`.
fn extend_hash(file: &File, hash: &mut RunningHash, upto: u64) -> Result<()> {
    let mut buf = vec![0u8; FS_BLOCK];
    while hash.hashed < upto {
        let want = ((upto - hash.hashed) as usize).min(buf.len());
        let n = file.read_at(&mut buf[..want], hash.hashed)?;
        if n == 0 {
            break;
        }
        hash.feed(&buf[..n]);
    }
    Ok(())
}

pub struct WatchedFile {
    pub rel: String,
    pub path: PathBuf,
    file: File,
    pub size: u64,
    pub mtime: SystemTime,
    pub read_cursor: u64,
    hash: Option<RunningHash>,
    pub subscribers: BTreeSet<SessionId>,
    next_scan_at: Instant,
    idle_backoff: Duration,
    pub dirty: bool,
}

impl WatchedFile {
    pub fn hash_hex(&self) -> Option<&str> {
        self.hash.as_ref().map(|h| h.hex.as_str())
    }
}

/// Stat outcome the engine must act on (notify and drop downloads).
#[derive(Debug)]
pub enum FileEvent {
    Deleted { rel: String, dropped: Vec<SessionId> },
    Truncated { rel: String, dropped: Vec<SessionId> },
    Replaced { rel: String, dropped: Vec<SessionId> },
}

impl FileEvent {
    pub fn rel(&self) -> &str {
        match self {
            FileEvent::Deleted { rel, .. }
            | FileEvent::Truncated { rel, .. }
            | FileEvent::Replaced { rel, .. } => rel,
        }
    }

    pub fn dropped(&self) -> &[SessionId] {
        match self {
            FileEvent::Deleted { dropped, .. }
            | FileEvent::Truncated { dropped, .. }
            | FileEvent::Replaced { dropped, .. } => dropped,
        }
    }
}

enum StatOutcome {
    Unchanged,
    Deleted,
    Truncated,
    Replaced,
}

pub struct Tracker {
    scanner: Scanner,
    checksums: bool,
    files: HashMap<String, WatchedFile>,
    tombstones: Vec<String>,
    stat_queue: VecDeque<String>,
}

impl Tracker {
    pub fn new(root: PathBuf, filter: ScanFilter, checksums: bool) -> Self {
        Tracker {
            scanner: Scanner::new(root, filter),
            checksums,
            files: HashMap::new(),
            tombstones: Vec::new(),
            stat_queue: VecDeque::new(),
        }
    }

    /// Rescan the tree once the stat queue has drained and pending
    /// tombstones have been flushed, then queue every watched path for a
    /// stat.
    pub fn refresh(&mut self, now: Instant) -> Result<()> {
        if !self.tombstones.is_empty() || !self.stat_queue.is_empty() {
            return Ok(());
        }
        self.scanner.rescan()?;
        let added = self.scanner.added().to_vec();
        for rel in added {
            self.watch(rel, now);
        }
        let mut keys: Vec<String> = self.files.keys().cloned().collect();
        keys.sort();
        self.stat_queue.extend(keys);
        Ok(())
    }

    fn watch(&mut self, rel: String, now: Instant) {
        let path = self.scanner.root().join(&rel);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) => {
                debug!("cannot open {}: {e}", path.display());
                return;
            }
        };
        let md = match file.metadata() {
            Ok(m) => m,
            Err(e) => {
                debug!("cannot stat {}: {e}", path.display());
                return;
            }
        };
        if md.nlink() == 0 {
            return;
        }
        let hash = if self.checksums {
            match hash_prefix(&file, md.len()) {
                Ok(h) => Some(h),
                Err(e) => {
                    warn!("hashing {} failed: {e}", path.display());
                    return;
                }
            }
        } else {
            None
        };
        info!("tracking {} ({} bytes)", rel, md.len());
        self.files.insert(
            rel.clone(),
            WatchedFile {
                rel,
                path,
                file,
                size: md.len(),
                mtime: md.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                read_cursor: 0,
                hash,
                subscribers: BTreeSet::new(),
                next_scan_at: now,
                idle_backoff: Duration::from_millis(SCAN_BACKOFF_MIN_MS),
                dirty: true,
            },
        );
    }

    /// Stat up to the per-tick batch of queued paths and apply the
    /// delete/truncate/replace rules.
    pub fn process_stat_queue(&mut self) -> Vec<FileEvent> {
        let checksums = self.checksums;
        let mut events = Vec::new();
        for _ in 0..STAT_BATCH {
            let Some(rel) = self.stat_queue.pop_front() else {
                break;
            };
            let outcome = {
                let Some(wf) = self.files.get_mut(&rel) else {
                    continue;
                };
                match wf.file.metadata() {
                    Err(e) => {
                        warn!("stat {} failed, treating as deleted: {e}", rel);
                        StatOutcome::Deleted
                    }
                    Ok(md) if md.nlink() == 0 => StatOutcome::Deleted,
                    Ok(md) => {
                        let new_size = md.len();
                        let new_mtime = md.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                        if new_size < wf.size {
                            wf.size = new_size;
                            wf.mtime = new_mtime;
                            if checksums {
                                match hash_prefix(&wf.file, new_size) {
                                    Ok(h) => wf.hash = Some(h),
                                    Err(e) => warn!("rehash {} failed: {e}", rel),
                                }
                            }
                            StatOutcome::Truncated
                        } else if new_mtime > wf.mtime {
                            if !wf.subscribers.is_empty() && new_size > wf.size {
                                // Growth under active followers: the append
                                // scan delivers the new bytes.
                                wf.size = new_size;
                                wf.mtime = new_mtime;
                                StatOutcome::Unchanged
                            } else if checksums {
                                if !wf.subscribers.is_empty() && wf.read_cursor < wf.size {
                                    // The running digest lags the file while
                                    // the append scan drains. Leave the mtime
                                    // unconsumed so this pass repeats, and
                                    // compare digests once the cursor catches
                                    // up.
                                    StatOutcome::Unchanged
                                } else {
                                    match hash_prefix(&wf.file, new_size) {
                                        Ok(h) => {
                                            let changed = wf
                                                .hash
                                                .as_ref()
                                                .map_or(true, |old| old.hex != h.hex);
                                            wf.size = new_size;
                                            wf.mtime = new_mtime;
                                            if changed {
                                                wf.hash = Some(h);
                                                StatOutcome::Replaced
                                            } else {
                                                StatOutcome::Unchanged
                                            }
                                        }
                                        Err(e) => {
                                            warn!("rehash {} failed: {e}", rel);
                                            StatOutcome::Unchanged
                                        }
                                    }
                                }
                            } else {
                                wf.size = new_size;
                                wf.mtime = new_mtime;
                                StatOutcome::Replaced
                            }
                        } else {
                            wf.size = new_size;
                            wf.mtime = new_mtime;
                            StatOutcome::Unchanged
                        }
                    }
                }
            };
            match outcome {
                StatOutcome::Unchanged => {}
                StatOutcome::Deleted => {
                    if let Some(wf) = self.files.remove(&rel) {
                        let dropped: Vec<SessionId> = wf.subscribers.iter().copied().collect();
                        info!("{} deleted at source", rel);
                        self.tombstones.push(rel.clone());
                        events.push(FileEvent::Deleted { rel, dropped });
                    }
                }
                StatOutcome::Truncated => {
                    let dropped = self.cancel_subscribers(&rel);
                    info!("{} truncated", rel);
                    events.push(FileEvent::Truncated { rel, dropped });
                }
                StatOutcome::Replaced => {
                    let dropped = self.cancel_subscribers(&rel);
                    info!("{} replaced", rel);
                    events.push(FileEvent::Replaced { rel, dropped });
                }
            }
        }
        events
    }

    /// Drop every subscriber and rewind the cursor; the file must be
    /// streamed from scratch.
    pub fn cancel_subscribers(&mut self, rel: &str) -> Vec<SessionId> {
        let Some(wf) = self.files.get_mut(rel) else {
            return Vec::new();
        };
        let dropped: Vec<SessionId> = wf.subscribers.iter().copied().collect();
        wf.subscribers.clear();
        wf.read_cursor = 0;
        wf.dirty = true;
        dropped
    }

    /// Files with followers that are due for an append poll.
    pub fn scan_candidates(&self, now: Instant) -> Vec<String> {
        self.files
            .values()
            .filter(|w| !w.subscribers.is_empty() && w.next_scan_at <= now)
            .map(|w| w.rel.clone())
            .collect()
    }

    pub fn subscribers_of(&self, rel: &str) -> Vec<SessionId> {
        self.files
            .get(rel)
            .map(|w| w.subscribers.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Read up to one block at the follower cursor without advancing.
    pub fn read_append(&self, rel: &str) -> Result<Vec<u8>> {
        let wf = self.files.get(rel).context("file not tracked")?;
        let mut buf = vec![0u8; FS_BLOCK];
        let n = wf
            .file
            .read_at(&mut buf, wf.read_cursor)
            .with_context(|| format!("read {}", rel))?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Account bytes that were delivered to every subscriber: extend the
    /// running hash, advance the cursor, reset the poll backoff.
    pub fn advance_append(&mut self, rel: &str, data: &[u8], now: Instant) {
        let Some(wf) = self.files.get_mut(rel) else {
            return;
        };
        if let Some(h) = wf.hash.as_mut() {
            debug_assert_eq!(h.hashed, wf.read_cursor);
            h.feed(data);
        }
        wf.read_cursor += data.len() as u64;
        if wf.size < wf.read_cursor {
            wf.size = wf.read_cursor;
        }
        wf.idle_backoff = Duration::from_millis(SCAN_BACKOFF_MIN_MS);
        wf.next_scan_at = now;
    }

    /// An append poll came back empty: back off, doubling up to the cap.
    pub fn scan_idle(&mut self, rel: &str, now: Instant) {
        let Some(wf) = self.files.get_mut(rel) else {
            return;
        };
        wf.next_scan_at = now + wf.idle_backoff;
        wf.idle_backoff =
            (wf.idle_backoff * 2).min(Duration::from_millis(SCAN_BACKOFF_MAX_MS));
    }

    pub fn contains(&self, rel: &str) -> bool {
        self.files.contains_key(rel)
    }

    pub fn get(&self, rel: &str) -> Option<&WatchedFile> {
        self.files.get(rel)
    }

    /// Read for a catch-up download, sharing the watched file's handle by
    /// offset.
    pub fn read_at(&self, rel: &str, offset: u64, len: usize) -> Result<Vec<u8>> {
        let wf = self.files.get(rel).context("file not tracked")?;
        let mut buf = vec![0u8; len];
        let n = wf
            .file
            .read_at(&mut buf, offset)
            .with_context(|| format!("read {}", rel))?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Promote a finished download into the follower set. With no
    /// followers the shared cursor adopts the download position; with
    /// followers present the positions must already agree, and promotion
    /// is deferred until the append scan catches up.
    pub fn try_promote(
        &mut self,
        rel: &str,
        session: SessionId,
        cursor: u64,
        now: Instant,
    ) -> Result<bool> {
        let wf = self.files.get_mut(rel).context("file not tracked")?;
        if wf.subscribers.is_empty() {
            if let Some(h) = wf.hash.as_mut() {
                extend_hash(&wf.file, h, cursor)?;
            }
            wf.read_cursor = cursor;
            if wf.size < cursor {
                wf.size = cursor;
            }
            wf.subscribers.insert(session);
            wf.idle_backoff = Duration::from_millis(SCAN_BACKOFF_MIN_MS);
            wf.next_scan_at = now;
            Ok(true)
        } else if wf.read_cursor == cursor {
            debug_assert_eq!(wf.read_cursor, cursor);
            wf.subscribers.insert(session);
            Ok(true)
        } else {
            debug!(
                "promotion deferred for {}: download at {}, followers at {}",
                rel, cursor, wf.read_cursor
            );
            Ok(false)
        }
    }

    /// One-pass sweep removing a torn-down session from every follower
    /// set.
    pub fn remove_session(&mut self, id: SessionId) {
        for wf in self.files.values_mut() {
            wf.subscribers.remove(&id);
        }
    }

    /// Anything a delta list would carry?
    pub fn has_dirty(&self) -> bool {
        !self.tombstones.is_empty() || self.files.values().any(|w| w.dirty)
    }

    /// Build a list update. A delta (`only_dirty`) clears the emitted
    /// dirty bits and drains the tombstones; a full snapshot leaves both
    /// alone so concurrent sessions still receive their delta.
    pub fn generate_list(&mut self, only_dirty: bool) -> ListUpdate {
        let mut out = ListUpdate::new();
        for wf in self.files.values_mut() {
            if only_dirty && !wf.dirty {
                continue;
            }
            out.insert(
                wf.rel.clone(),
                ListEntry {
                    s: wf.size as i64,
                    c: wf.hash.as_ref().map(|h| h.hex.clone()),
                },
            );
            if only_dirty {
                wf.dirty = false;
            }
        }
        if only_dirty {
            for rel in self.tombstones.drain(..) {
                out.insert(rel, ListEntry { s: TOMBSTONE, c: None });
            }
        } else {
            for rel in &self.tombstones {
                out.insert(rel.clone(), ListEntry { s: TOMBSTONE, c: None });
            }
        }
        out
    }
}
