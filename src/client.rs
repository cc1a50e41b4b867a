//! Target-side engine: connection upkeep, list reconciliation, block
//! application, resumable offsets.
//!
//! Each configured source gets a mirror subdirectory named after it under
//! the working directory. The engine value behind a mutex holds the whole
//! mirror state; per-source reader tasks feed decoded packets into it and
//! a 100 ms tick reconnects dropped sources and schedules STREAM requests
//! against the global concurrency budget.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::daemon::ShutdownGuard;
use crate::iobuf::IoBuffer;
use crate::protocol::{
    MAX_CONCURRENT_DOWNLOADS, NETWORK_BLOCK, READ_HEADROOM, RECONNECT_DELAY_SECS,
    SESSION_BUFFER, TICK_MS,
};
use crate::resume::ResumeStore;
use crate::wire::{self, decode_frame, Decoded, Packet, Request, StreamStatus};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub port: u16,
    pub dir: PathBuf,
    pub sources: Vec<String>,
    pub echo_stdout: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MirrorState {
    NotRequested,
    Requested,
    InProgress,
    Complete,
    Failed,
}

struct MirrorEntry {
    size: u64,
    state: MirrorState,
    hash: Option<String>,
}

struct SourceLink {
    epoch: u64,
    wbuf: Arc<Mutex<IoBuffer>>,
    wnotify: Arc<Notify>,
    rbuf: Arc<Mutex<IoBuffer>>,
}

struct SourceConn {
    link: Option<SourceLink>,
    epoch: u64,
    next_reconnect_at: Instant,
    list_received: bool,
}

struct ClientEngine {
    dir: PathBuf,
    echo_stdout: bool,
    sources: HashMap<String, SourceConn>,
    mirror: std::collections::BTreeMap<(String, String), MirrorEntry>,
    resume: ResumeStore,
    inflight: usize,
}

/// Build a traversal-safe relative path from a wire path: no absolute
/// components, no parent references, no NUL.
fn normalize_rel(raw: &str) -> Option<String> {
    if raw.is_empty() || raw.contains('\0') || raw.starts_with('/') {
        return None;
    }
    let mut parts = Vec::new();
    for comp in raw.split('/') {
        match comp {
            "" | "." => {}
            ".." => return None,
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

impl ClientEngine {
    fn new(dir: PathBuf, sources: Vec<String>, echo_stdout: bool, resume: ResumeStore) -> Self {
        let now = Instant::now();
        let sources = sources
            .into_iter()
            .map(|name| {
                (
                    name,
                    SourceConn {
                        link: None,
                        epoch: 0,
                        next_reconnect_at: now,
                        list_received: false,
                    },
                )
            })
            .collect();
        ClientEngine {
            dir,
            echo_stdout,
            sources,
            mirror: std::collections::BTreeMap::new(),
            resume,
            inflight: 0,
        }
    }

    /// Load the cached mirror of each configured source: sizes from stat,
    /// everything pending a fresh request.
    fn scan_mirrors(&mut self) {
        let names: Vec<String> = self.sources.keys().cloned().collect();
        for source in names {
            let base = self.dir.join(&source);
            if !base.is_dir() {
                continue;
            }
            let mut count = 0usize;
            for entry in WalkDir::new(&base)
                .follow_links(false)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = match entry.path().strip_prefix(&base).ok().and_then(|r| r.to_str()) {
                    Some(r) => r.to_string(),
                    None => continue,
                };
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                if let Some(stored) = self.resume.get(&source, &rel) {
                    if stored >= 0 && stored as u64 != size {
                        debug!(
                            "{}/{}: stored offset {} differs from local size {}",
                            source, rel, stored, size
                        );
                    }
                }
                self.mirror.insert(
                    (source.clone(), rel),
                    MirrorEntry {
                        size,
                        state: MirrorState::NotRequested,
                        hash: None,
                    },
                );
                count += 1;
            }
            info!("cached mirror of {}: {} files", source, count);
        }
    }

    fn due_connects(&mut self, now: Instant) -> Vec<String> {
        let mut due = Vec::new();
        for (name, conn) in self.sources.iter_mut() {
            if conn.link.is_none() && now >= conn.next_reconnect_at {
                conn.next_reconnect_at = now + Duration::from_secs(RECONNECT_DELAY_SECS);
                due.push(name.clone());
            }
        }
        due
    }

    /// Register a fresh connection and queue the initial LIST.
    fn attach(
        &mut self,
        source: &str,
    ) -> Option<(u64, Arc<Mutex<IoBuffer>>, Arc<Notify>, Arc<Mutex<IoBuffer>>)> {
        let conn = self.sources.get_mut(source)?;
        conn.epoch += 1;
        conn.list_received = false;
        let link = SourceLink {
            epoch: conn.epoch,
            wbuf: Arc::new(Mutex::new(IoBuffer::new(SESSION_BUFFER))),
            wnotify: Arc::new(Notify::new()),
            rbuf: Arc::new(Mutex::new(IoBuffer::new(SESSION_BUFFER))),
        };
        let handles = (
            conn.epoch,
            link.wbuf.clone(),
            link.wnotify.clone(),
            link.rbuf.clone(),
        );
        conn.link = Some(link);
        match Request::List.encode() {
            Ok(bytes) => {
                handles.1.lock().add(&bytes);
                handles.2.notify_one();
            }
            Err(e) => error!("encode LIST failed: {e:#}"),
        }
        Some(handles)
    }

    fn link_alive(&self, source: &str, epoch: u64) -> bool {
        self.sources
            .get(source)
            .and_then(|c| c.link.as_ref())
            .map_or(false, |l| l.epoch == epoch)
    }

    /// Tear down a connection: pending and finished streams alike must be
    /// re-requested on the next session, sockets stay keyed by source
    /// name only.
    fn disconnect(&mut self, source: &str, epoch: u64, now: Instant) {
        let Some(conn) = self.sources.get_mut(source) else {
            return;
        };
        match conn.link.as_ref() {
            Some(link) if link.epoch == epoch => {}
            _ => return,
        }
        if let Some(link) = conn.link.take() {
            link.wnotify.notify_one();
        }
        conn.list_received = false;
        conn.next_reconnect_at = now + Duration::from_secs(RECONNECT_DELAY_SECS);
        info!(
            "{} disconnected, retrying in {}s",
            source, RECONNECT_DELAY_SECS
        );
        for ((src, _), ent) in self.mirror.iter_mut() {
            if src != source {
                continue;
            }
            match ent.state {
                MirrorState::Requested | MirrorState::InProgress => {
                    self.inflight = self.inflight.saturating_sub(1);
                    ent.state = MirrorState::NotRequested;
                }
                MirrorState::Complete | MirrorState::Failed => {
                    ent.state = MirrorState::NotRequested;
                }
                MirrorState::NotRequested => {}
            }
        }
    }

    /// Issue STREAM requests for pending mirror entries, bounded by the
    /// global download budget and per-source read headroom.
    fn schedule_streams(&mut self) {
        if self.inflight >= MAX_CONCURRENT_DOWNLOADS {
            return;
        }
        let mut budget = MAX_CONCURRENT_DOWNLOADS - self.inflight;
        let ready: HashMap<String, (Arc<Mutex<IoBuffer>>, Arc<Notify>)> = self
            .sources
            .iter()
            .filter_map(|(name, conn)| {
                let link = conn.link.as_ref()?;
                if !conn.list_received || link.rbuf.lock().space() < READ_HEADROOM {
                    return None;
                }
                Some((name.clone(), (link.wbuf.clone(), link.wnotify.clone())))
            })
            .collect();
        if ready.is_empty() {
            return;
        }
        let mut sent = 0usize;
        for ((src, rel), ent) in self.mirror.iter_mut() {
            if budget == 0 {
                break;
            }
            if ent.state != MirrorState::NotRequested {
                continue;
            }
            let Some((wbuf, wnotify)) = ready.get(src) else {
                continue;
            };
            match (Request::Stream {
                path: Some(rel.clone()),
                offset: ent.size,
            })
            .encode()
            {
                Ok(bytes) => {
                    wbuf.lock().add(&bytes);
                    wnotify.notify_one();
                    ent.state = MirrorState::Requested;
                    debug!("requested {}/{} from offset {}", src, rel, ent.size);
                    budget -= 1;
                    sent += 1;
                }
                Err(e) => error!("encode STREAM failed: {e:#}"),
            }
        }
        self.inflight += sent;
    }

    fn apply_packet(&mut self, source: &str, epoch: u64, packet: Packet) {
        if !self.link_alive(source, epoch) {
            return;
        }
        match packet {
            Packet::List { full, entries } => self.reconcile(source, full, entries),
            Packet::Block { path, offset, data } => {
                self.append_block(source, &path, offset, &data)
            }
            Packet::Status {
                path,
                status,
                message,
            } => self.stream_status(source, path, status, message),
        }
    }

    /// Apply a list update. Only a full list may delete by omission;
    /// deltas delete through explicit tombstones.
    fn reconcile(&mut self, source: &str, full: bool, entries: wire::ListUpdate) {
        if full {
            if let Some(conn) = self.sources.get_mut(source) {
                conn.list_received = true;
            }
        }
        let mut listed: HashSet<String> = HashSet::new();
        for (raw, entry) in &entries {
            let Some(rel) = normalize_rel(raw) else {
                warn!("{}: unsafe path {:?} in list", source, raw);
                continue;
            };
            if entry.s < 0 {
                self.remove_entry(source, &rel, "deleted at source");
                continue;
            }
            listed.insert(rel.clone());
            let remote_size = entry.s as u64;
            let key = (source.to_string(), rel.clone());
            let snapshot = self
                .mirror
                .get(&key)
                .map(|e| (e.size, e.state, e.hash.clone()));
            match snapshot {
                Some((size, state, hash)) => {
                    let shrank = size > remote_size + NETWORK_BLOCK as u64;
                    let digest_changed = matches!(
                        (&hash, &entry.c),
                        (Some(ours), Some(theirs)) if ours != theirs
                    );
                    let failed = state == MirrorState::Failed;
                    if shrank || digest_changed || failed {
                        info!(
                            "{}/{} restarting from zero (shrank={} digest_changed={} failed={})",
                            source, rel, shrank, digest_changed, failed
                        );
                        if matches!(state, MirrorState::Requested | MirrorState::InProgress) {
                            self.inflight = self.inflight.saturating_sub(1);
                        }
                        if let Err(e) = self.truncate_local(source, &rel) {
                            warn!("reset {}/{} failed: {e:#}", source, rel);
                            continue;
                        }
                        if let Some(ent) = self.mirror.get_mut(&key) {
                            ent.size = 0;
                            ent.state = MirrorState::NotRequested;
                            ent.hash = entry.c.clone();
                        }
                        if let Err(e) = self.resume.set(source, &rel, 0) {
                            warn!("resume store: {e:#}");
                        }
                    } else if hash.is_none() && entry.c.is_some() {
                        if let Some(ent) = self.mirror.get_mut(&key) {
                            ent.hash = entry.c.clone();
                        }
                    }
                }
                None => {
                    if let Err(e) = self.truncate_local(source, &rel) {
                        warn!("create {}/{} failed: {e:#}", source, rel);
                        continue;
                    }
                    info!("{}/{} appeared at source", source, rel);
                    self.mirror.insert(
                        key,
                        MirrorEntry {
                            size: 0,
                            state: MirrorState::NotRequested,
                            hash: entry.c.clone(),
                        },
                    );
                    if let Err(e) = self.resume.set(source, &rel, 0) {
                        warn!("resume store: {e:#}");
                    }
                }
            }
        }
        if full {
            let stale: Vec<(String, String)> = self
                .mirror
                .keys()
                .filter(|(src, rel)| src == source && !listed.contains(rel))
                .cloned()
                .collect();
            for (src, rel) in stale {
                self.remove_entry(&src, &rel, "no longer at source");
            }
        }
    }

    fn remove_entry(&mut self, source: &str, rel: &str, why: &str) {
        let key = (source.to_string(), rel.to_string());
        if let Some(ent) = self.mirror.remove(&key) {
            if matches!(ent.state, MirrorState::Requested | MirrorState::InProgress) {
                self.inflight = self.inflight.saturating_sub(1);
            }
            info!("{}/{} {}", source, rel, why);
        }
        let path = self.dir.join(source).join(rel);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("remove {} failed: {e}", path.display());
            }
        }
        if let Err(e) = self.resume.tombstone(source, rel) {
            warn!("resume store: {e:#}");
        }
    }

    // Create (or truncate) the local file, with parent directories.
    fn truncate_local(&self, source: &str, rel: &str) -> Result<()> {
        let path = self.dir.join(source).join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        fs::File::create(&path).with_context(|| format!("create {}", path.display()))?;
        Ok(())
    }

    fn append_block(&mut self, source: &str, raw: &str, offset: u64, data: &[u8]) {
        let Some(rel) = normalize_rel(raw) else {
            warn!("{}: unsafe path {:?} in block", source, raw);
            return;
        };
        let key = (source.to_string(), rel.clone());
        let Some(ent) = self.mirror.get_mut(&key) else {
            warn!("{}: block for unknown file {}", source, rel);
            return;
        };
        if offset != ent.size {
            debug!(
                "{}/{}: block offset {} with local size {}",
                source, rel, offset, ent.size
            );
        }
        let path = self.dir.join(source).join(&rel);
        let written = (|| -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut f = OpenOptions::new().append(true).create(true).open(&path)?;
            f.write_all(data)
        })();
        if let Err(e) = written {
            // Leave the recorded size alone so the next update retries.
            warn!("write {} failed: {e}", path.display());
            return;
        }
        ent.size += data.len() as u64;
        let new_size = ent.size as i64;
        if let Err(e) = self.resume.set(source, &rel, new_size) {
            warn!("resume store: {e:#}");
        }
        if self.echo_stdout {
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            if out.write_all(data).and_then(|_| out.flush()).is_err() {
                debug!("stdout echo failed");
            }
        }
    }

    fn stream_status(
        &mut self,
        source: &str,
        path: Option<String>,
        status: StreamStatus,
        message: Option<String>,
    ) {
        let rel = path.as_deref().and_then(normalize_rel);
        let key = rel.as_ref().map(|r| (source.to_string(), r.clone()));
        match status {
            StreamStatus::InProgress => {
                if let Some(ent) = key.and_then(|k| self.mirror.get_mut(&k)) {
                    if ent.state == MirrorState::Requested {
                        ent.state = MirrorState::InProgress;
                    }
                }
            }
            StreamStatus::Complete => {
                if let Some(ent) = key.and_then(|k| self.mirror.get_mut(&k)) {
                    if matches!(ent.state, MirrorState::Requested | MirrorState::InProgress) {
                        self.inflight = self.inflight.saturating_sub(1);
                    }
                    ent.state = MirrorState::Complete;
                    debug!("{}/{:?} up to date, following", source, rel);
                }
            }
            StreamStatus::Failed => {
                warn!("{}: stream failed for {:?}", source, rel);
                let Some(k) = key else {
                    return;
                };
                match self.mirror.get(&k).map(|e| e.state) {
                    // Our own request was refused (the offset may have run
                    // past a shrunken file): restart from scratch. A
                    // request for a path the source just deleted keeps
                    // failing only until its tombstone arrives.
                    Some(MirrorState::Requested | MirrorState::InProgress) => {
                        self.inflight = self.inflight.saturating_sub(1);
                        if let Err(e) = self.truncate_local(&k.0, &k.1) {
                            warn!("reset {}/{} failed: {e:#}", k.0, k.1);
                            if let Some(ent) = self.mirror.get_mut(&k) {
                                ent.state = MirrorState::Failed;
                            }
                            return;
                        }
                        if let Some(ent) = self.mirror.get_mut(&k) {
                            ent.size = 0;
                            ent.state = MirrorState::NotRequested;
                        }
                        if let Err(e) = self.resume.set(&k.0, &k.1, 0) {
                            warn!("resume store: {e:#}");
                        }
                    }
                    // An unsolicited failure means the file changed under
                    // its followers; the delta list that follows carries
                    // the authoritative state.
                    Some(_) => {
                        if let Some(ent) = self.mirror.get_mut(&k) {
                            ent.state = MirrorState::Failed;
                        }
                    }
                    None => {}
                }
            }
            StreamStatus::Error => {
                error!(
                    "{}: server error{}",
                    source,
                    message.map(|m| format!(": {m}")).unwrap_or_default()
                );
                if let Some(ent) = key.and_then(|k| self.mirror.get_mut(&k)) {
                    if matches!(ent.state, MirrorState::Requested | MirrorState::InProgress) {
                        self.inflight = self.inflight.saturating_sub(1);
                        ent.state = MirrorState::Failed;
                    }
                }
            }
            StreamStatus::Ok => {}
        }
    }
}

/// Run the target-side engine until the task is dropped.
pub async fn run(cfg: ClientConfig) -> Result<()> {
    let dir = cfg
        .dir
        .canonicalize()
        .with_context(|| format!("working directory {}", cfg.dir.display()))?;
    let resume = ResumeStore::open(&dir)?;
    let mut engine = ClientEngine::new(dir, cfg.sources.clone(), cfg.echo_stdout, resume);
    engine.scan_mirrors();
    let engine = Arc::new(Mutex::new(engine));

    let shutdown = Arc::new(Notify::new());
    let _guard = ShutdownGuard::new(shutdown.clone());
    let port = cfg.port;
    let mut ticker = tokio::time::interval(Duration::from_millis(TICK_MS));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let due = engine.lock().due_connects(Instant::now());
        for source in due {
            tokio::spawn(connect_source(
                engine.clone(),
                shutdown.clone(),
                source,
                port,
            ));
        }
        engine.lock().schedule_streams();
    }
}

async fn connect_source(
    engine: Arc<Mutex<ClientEngine>>,
    shutdown: Arc<Notify>,
    source: String,
    port: u16,
) {
    let attempt = tokio::time::timeout(
        Duration::from_secs(RECONNECT_DELAY_SECS),
        TcpStream::connect((source.as_str(), port)),
    )
    .await;
    match attempt {
        Ok(Ok(stream)) => {
            info!("connected to {}:{}", source, port);
            let (rd, wr) = stream.into_split();
            let Some((epoch, wbuf, wnotify, rbuf)) = engine.lock().attach(&source) else {
                return;
            };
            tokio::spawn(source_writer(
                engine.clone(),
                shutdown.clone(),
                source.clone(),
                epoch,
                wr,
                wbuf,
                wnotify,
            ));
            tokio::spawn(source_reader(engine, shutdown, source, epoch, rd, rbuf));
        }
        Ok(Err(e)) => debug!("connect {}:{} failed: {e}", source, port),
        Err(_) => debug!("connect {}:{} timed out", source, port),
    }
}

async fn source_writer(
    engine: Arc<Mutex<ClientEngine>>,
    shutdown: Arc<Notify>,
    source: String,
    epoch: u64,
    mut wr: OwnedWriteHalf,
    wbuf: Arc<Mutex<IoBuffer>>,
    wnotify: Arc<Notify>,
) {
    loop {
        let chunk = { wbuf.lock().get(NETWORK_BLOCK) };
        if chunk.is_empty() {
            if !engine.lock().link_alive(&source, epoch) {
                return;
            }
            tokio::select! {
                _ = wnotify.notified() => {}
                _ = shutdown.notified() => return,
            }
            continue;
        }
        if let Err(e) = wr.write_all(&chunk).await {
            debug!("{} write failed: {e}", source);
            engine.lock().disconnect(&source, epoch, Instant::now());
            return;
        }
    }
}

async fn source_reader(
    engine: Arc<Mutex<ClientEngine>>,
    shutdown: Arc<Notify>,
    source: String,
    epoch: u64,
    mut rd: OwnedReadHalf,
    rbuf: Arc<Mutex<IoBuffer>>,
) {
    let mut sock = vec![0u8; NETWORK_BLOCK];
    loop {
        let n = tokio::select! {
            r = rd.read(&mut sock) => match r {
                Ok(0) => {
                    engine.lock().disconnect(&source, epoch, Instant::now());
                    return;
                }
                Ok(n) => n,
                Err(e) => {
                    debug!("{} read failed: {e}", source);
                    engine.lock().disconnect(&source, epoch, Instant::now());
                    return;
                }
            },
            _ = shutdown.notified() => return,
        };
        let mut frames = Vec::new();
        let mut fatal = false;
        {
            let mut buf = rbuf.lock();
            buf.add(&sock[..n]);
            loop {
                match decode_frame(&mut buf) {
                    Ok(Decoded::Frame(f)) => frames.push(f),
                    Ok(Decoded::Incomplete) => break,
                    Ok(Decoded::Malformed) => {
                        error!("{}: malformed response header", source);
                    }
                    Err(e) => {
                        error!("{}: {e:#}", source);
                        fatal = true;
                        break;
                    }
                }
            }
        }
        if fatal {
            engine.lock().disconnect(&source, epoch, Instant::now());
            return;
        }
        for frame in frames {
            match Packet::from_frame(frame) {
                Ok(packet) => engine.lock().apply_packet(&source, epoch, packet),
                Err(e) => error!("{}: dropping response frame: {e:#}", source),
            }
        }
    }
}
