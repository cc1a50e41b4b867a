//! Durable resume offsets for the target side.
//!
//! An append-only JSONL log keyed by `(source, path)`; the newest record
//! for a key wins. Loading replays the log and compacts it in place. An
//! offset of -1 tombstones a previously deleted path — the convention is
//! kept even though this store could simply drop the key, so that the
//! on-disk format stays compatible with stores that cannot delete.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Offset value marking a deleted path.
pub const TOMBSTONE: i64 = -1;

const STORE_FILE: &str = ".rstream_offsets.jsonl";

#[derive(Serialize, Deserialize, Debug)]
struct OffsetRecord {
    timestamp: String,
    source: String,
    path: String,
    offset: i64,
}

pub struct ResumeStore {
    log_path: PathBuf,
    offsets: HashMap<(String, String), i64>,
}

impl ResumeStore {
    /// Replay the log under `dir`, compacting it to one record per key.
    pub fn open(dir: &Path) -> Result<Self> {
        let log_path = dir.join(STORE_FILE);
        let mut offsets = HashMap::new();
        if log_path.exists() {
            let file = File::open(&log_path)
                .with_context(|| format!("open resume store {}", log_path.display()))?;
            for line in BufReader::new(file).lines() {
                let line = line.context("read resume store")?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<OffsetRecord>(&line) {
                    Ok(rec) => {
                        offsets.insert((rec.source, rec.path), rec.offset);
                    }
                    Err(e) => warn!("skipping corrupt resume record: {e}"),
                }
            }
        }
        let store = ResumeStore { log_path, offsets };
        store.compact()?;
        Ok(store)
    }

    pub fn get(&self, source: &str, path: &str) -> Option<i64> {
        self.offsets
            .get(&(source.to_string(), path.to_string()))
            .copied()
    }

    /// Record `offset` for the key, appending one log record when the
    /// value changed.
    pub fn set(&mut self, source: &str, path: &str, offset: i64) -> Result<()> {
        let prev = self
            .offsets
            .insert((source.to_string(), path.to_string()), offset);
        if prev == Some(offset) {
            return Ok(());
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .with_context(|| format!("append resume store {}", self.log_path.display()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(
            &mut writer,
            &OffsetRecord {
                timestamp: Utc::now().to_rfc3339(),
                source: source.to_string(),
                path: path.to_string(),
                offset,
            },
        )?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    /// Mark a deleted path.
    pub fn tombstone(&mut self, source: &str, path: &str) -> Result<()> {
        self.set(source, path, TOMBSTONE)
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    // Rewrite the log with one record per key, via a temp file renamed
    // into place.
    fn compact(&self) -> Result<()> {
        let tmp_path = self.log_path.with_extension("jsonl.tmp");
        {
            let file = File::create(&tmp_path)
                .with_context(|| format!("create {}", tmp_path.display()))?;
            let mut writer = BufWriter::new(file);
            let mut keys: Vec<_> = self.offsets.keys().collect();
            keys.sort();
            let now = Utc::now().to_rfc3339();
            for key in keys {
                serde_json::to_writer(
                    &mut writer,
                    &OffsetRecord {
                        timestamp: now.clone(),
                        source: key.0.clone(),
                        path: key.1.clone(),
                        offset: self.offsets[key],
                    },
                )?;
                writer.write_all(b"\n")?;
            }
            writer.flush()?;
        }
        std::fs::rename(&tmp_path, &self.log_path).context("replace resume store")?;
        Ok(())
    }
}
