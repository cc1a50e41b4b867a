//! Recursive enumeration of regular files under the shared root.
//!
//! Dot-named entries are skipped, symlinks are followed (with visited-set
//! cycle avoidance), and the include/exclude regexes apply to basenames.
//! The scanner keeps the last two scans and exposes present, added and
//! removed views so the tracker can diff cheaply.

use anyhow::{Context, Result};
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Clone)]
pub struct ScanFilter {
    include: Regex,
    exclude: Option<Regex>,
}

impl ScanFilter {
    pub fn new(include: &str, exclude: Option<&str>) -> Result<Self> {
        Ok(ScanFilter {
            include: Regex::new(include)
                .with_context(|| format!("include pattern {include:?}"))?,
            exclude: exclude
                .map(|x| Regex::new(x).with_context(|| format!("exclude pattern {x:?}")))
                .transpose()?,
        })
    }

    fn matches(&self, name: &str) -> bool {
        self.include.is_match(name)
            && !self.exclude.as_ref().map_or(false, |x| x.is_match(name))
    }
}

pub struct Scanner {
    root: PathBuf,
    filter: ScanFilter,
    present: HashSet<String>,
    added: Vec<String>,
    removed: Vec<String>,
}

impl Scanner {
    pub fn new(root: PathBuf, filter: ScanFilter) -> Self {
        Scanner {
            root,
            filter,
            present: HashSet::new(),
            added: Vec::new(),
            removed: Vec::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Walk the tree and refresh the present/added/removed views.
    pub fn rescan(&mut self) -> Result<()> {
        let mut seen = HashSet::new();
        let mut visited_dirs: HashSet<PathBuf> = HashSet::new();
        let mut walker = WalkDir::new(&self.root).follow_links(true).into_iter();
        while let Some(next) = walker.next() {
            let entry = match next {
                Ok(e) => e,
                Err(_) => continue,
            };
            if entry.depth() > 0
                && entry
                    .file_name()
                    .to_str()
                    .map_or(true, |n| n.starts_with('.'))
            {
                if entry.file_type().is_dir() {
                    walker.skip_current_dir();
                }
                continue;
            }
            if entry.file_type().is_dir() {
                // Cycle avoidance when following directory symlinks.
                if let Ok(canon) = std::fs::canonicalize(entry.path()) {
                    if !visited_dirs.insert(canon) {
                        walker.skip_current_dir();
                    }
                }
                continue;
            }
            let md = match entry.metadata() {
                Ok(m) => m,
                Err(_) => continue,
            };
            if !md.is_file() {
                continue;
            }
            let name = match entry.file_name().to_str() {
                Some(n) => n,
                None => continue,
            };
            if !self.filter.matches(name) {
                continue;
            }
            let rel = match entry.path().strip_prefix(&self.root) {
                Ok(r) => r,
                Err(_) => continue,
            };
            let rel = match rel.to_str() {
                Some(r) => r,
                None => continue,
            };
            // Headers are scanned to the first `}`; such names cannot frame.
            if rel.contains('}') {
                continue;
            }
            seen.insert(rel.to_string());
        }
        self.added = seen.difference(&self.present).cloned().collect();
        self.removed = self.present.difference(&seen).cloned().collect();
        self.added.sort();
        self.removed.sort();
        self.present = seen;
        Ok(())
    }

    pub fn present(&self) -> &HashSet<String> {
        &self.present
    }

    pub fn added(&self) -> &[String] {
        &self.added
    }

    pub fn removed(&self) -> &[String] {
        &self.removed
    }
}
