//! Source-side engine: accept loop, session plumbing, tick-driven file
//! tracking and fan-out.
//!
//! All mutable state lives in one `Engine` value behind a mutex, so every
//! transition is serialized exactly as in a single-threaded loop. Each
//! accepted connection gets a reader task (request parsing) and a writer
//! task (draining the session's bounded write buffer); a 100 ms tick
//! drives the tracker, feeds catch-up downloads, and broadcasts list
//! deltas.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::daemon::ShutdownGuard;
use crate::iobuf::IoBuffer;
use crate::protocol::{
    FRAME_SLACK, FS_BLOCK, NETWORK_BLOCK, SESSION_BUFFER, TICK_MS,
};
use crate::scanner::ScanFilter;
use crate::tracker::{FileEvent, SessionId, Tracker};
use crate::wire::{
    self, decode_frame, Decoded, Request, StreamStatus,
};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub root: PathBuf,
    pub include: String,
    pub compress: bool,
    pub checksums: bool,
}

struct Session {
    peer: SocketAddr,
    wbuf: Arc<Mutex<IoBuffer>>,
    wnotify: Arc<Notify>,
}

struct Download {
    session: SessionId,
    rel: String,
    cursor: u64,
}

struct Engine {
    tracker: Tracker,
    sessions: HashMap<SessionId, Session>,
    downloads: Vec<Download>,
    compress: bool,
}

impl Engine {
    fn new(tracker: Tracker, compress: bool) -> Self {
        Engine {
            tracker,
            sessions: HashMap::new(),
            downloads: Vec::new(),
            compress,
        }
    }

    /// Queue bytes on a session's write buffer and wake its writer.
    /// Control packets queue unconditionally; bulk senders check `space`
    /// before building the block.
    fn enqueue(&self, id: SessionId, bytes: &[u8]) {
        if let Some(sess) = self.sessions.get(&id) {
            if !sess.wbuf.lock().add(bytes) {
                warn!("session {} write buffer over capacity", id);
            }
            sess.wnotify.notify_one();
        }
    }

    fn enqueue_status(&self, id: SessionId, path: Option<&str>, status: StreamStatus, msg: Option<&str>) {
        match wire::encode_status(path, status, msg) {
            Ok(bytes) => self.enqueue(id, &bytes),
            Err(e) => error!("encode status failed: {e:#}"),
        }
    }

    fn remove_session(&mut self, id: SessionId) {
        if let Some(sess) = self.sessions.remove(&id) {
            info!("session {} from {} closed", id, sess.peer);
            sess.wnotify.notify_one();
        }
        self.tracker.remove_session(id);
        self.downloads.retain(|d| d.session != id);
    }

    fn handle_request(&mut self, id: SessionId, req: Request) {
        match req {
            Request::List => {
                let entries = self.tracker.generate_list(false);
                debug!("session {}: LIST -> {} entries", id, entries.len());
                match wire::encode_list(true, &entries) {
                    Ok(bytes) => self.enqueue(id, &bytes),
                    Err(e) => error!("encode list failed: {e:#}"),
                }
            }
            Request::Stream { path: None, .. } => {
                warn!("session {}: STREAM without a path", id);
                self.enqueue_status(id, None, StreamStatus::Failed, None);
            }
            Request::Stream { path: Some(rel), offset } => {
                if self.tracker.contains(&rel) {
                    debug!("session {}: STREAM {} from {}", id, rel, offset);
                    self.downloads.push(Download {
                        session: id,
                        rel: rel.clone(),
                        cursor: offset,
                    });
                    self.enqueue_status(id, Some(&rel), StreamStatus::InProgress, None);
                } else {
                    debug!("session {}: STREAM for untracked {}", id, rel);
                    self.enqueue_status(id, Some(&rel), StreamStatus::Failed, None);
                }
            }
            Request::Block { path } => {
                // Reserved verb.
                self.enqueue_status(id, path.as_deref(), StreamStatus::Failed, None);
            }
            Request::Unknown(verb) => {
                warn!("session {}: unknown request {:?}", id, verb);
                self.enqueue_status(id, None, StreamStatus::Error, Some("unknown request"));
            }
        }
    }

    fn reply_bad_request(&self, id: SessionId) {
        self.enqueue_status(id, None, StreamStatus::Error, Some("bad request"));
    }

    /// One engine tick: rescan/stat, deliver appends, feed downloads,
    /// broadcast the delta list.
    fn tick(&mut self, now: Instant) {
        if let Err(e) = self.tracker.refresh(now) {
            warn!("rescan failed: {e:#}");
        }
        let events = self.tracker.process_stat_queue();
        for event in events {
            self.handle_file_event(event);
        }
        self.scan_new_data(now);
        self.feed_downloads(now);
        if self.tracker.has_dirty() {
            let entries = self.tracker.generate_list(true);
            if !entries.is_empty() {
                match wire::encode_list(false, &entries) {
                    Ok(bytes) => {
                        let ids: Vec<SessionId> = self.sessions.keys().copied().collect();
                        for id in ids {
                            self.enqueue(id, &bytes);
                        }
                    }
                    Err(e) => error!("encode delta list failed: {e:#}"),
                }
            }
        }
    }

    /// A file was deleted, truncated, or replaced: drop its downloads and
    /// tell every affected session to re-request.
    fn handle_file_event(&mut self, event: FileEvent) {
        let rel = event.rel().to_string();
        let mut affected: Vec<SessionId> = event.dropped().to_vec();
        self.downloads.retain(|d| {
            if d.rel == rel {
                affected.push(d.session);
                false
            } else {
                true
            }
        });
        affected.sort_unstable();
        affected.dedup();
        for id in affected {
            self.enqueue_status(id, Some(&rel), StreamStatus::Failed, None);
        }
    }

    /// Deliver fresh bytes of each due file to all of its followers. The
    /// shared cursor moves only when every follower has buffer room.
    fn scan_new_data(&mut self, now: Instant) {
        for rel in self.tracker.scan_candidates(now) {
            let subs = self.tracker.subscribers_of(&rel);
            let need = FS_BLOCK + FRAME_SLACK;
            let stalled = subs.iter().any(|id| {
                self.sessions
                    .get(id)
                    .map_or(false, |s| s.wbuf.lock().space() < need)
            });
            if stalled {
                debug!("{}: follower buffer full, holding cursor", rel);
                continue;
            }
            let data = match self.tracker.read_append(&rel) {
                Ok(d) => d,
                Err(e) => {
                    warn!("append read {} failed: {e:#}", rel);
                    continue;
                }
            };
            if data.is_empty() {
                self.tracker.scan_idle(&rel, now);
                continue;
            }
            let offset = match self.tracker.get(&rel) {
                Some(wf) => wf.read_cursor,
                None => continue,
            };
            let frame = match wire::encode_block(&rel, offset, &data, self.compress) {
                Ok(f) => f,
                Err(e) => {
                    error!("compress block {} @{}: {e:#}", rel, offset);
                    continue;
                }
            };
            for id in &subs {
                self.enqueue(*id, &frame);
            }
            self.tracker.advance_append(&rel, &data, now);
        }
    }

    /// Advance catch-up downloads whose sessions have room; at EOF the
    /// session is promoted into the follower set.
    fn feed_downloads(&mut self, now: Instant) {
        let mut i = 0;
        while i < self.downloads.len() {
            let (id, rel, cursor) = {
                let d = &self.downloads[i];
                (d.session, d.rel.clone(), d.cursor)
            };
            let Some(sess) = self.sessions.get(&id) else {
                self.downloads.swap_remove(i);
                continue;
            };
            if sess.wbuf.lock().space() < 2 * FS_BLOCK {
                i += 1;
                continue;
            }
            if !self.tracker.contains(&rel) {
                self.enqueue_status(id, Some(&rel), StreamStatus::Failed, None);
                self.downloads.swap_remove(i);
                continue;
            }
            let size = self.tracker.get(&rel).map(|w| w.size).unwrap_or(0);
            if cursor > size {
                // The file shrank underneath the request.
                self.enqueue_status(id, Some(&rel), StreamStatus::Failed, None);
                self.downloads.swap_remove(i);
                continue;
            }
            let data = match self.tracker.read_at(&rel, cursor, FS_BLOCK) {
                Ok(d) => d,
                Err(e) => {
                    warn!("download read {} failed: {e:#}", rel);
                    self.enqueue_status(id, Some(&rel), StreamStatus::Failed, None);
                    self.downloads.swap_remove(i);
                    continue;
                }
            };
            if data.is_empty() {
                // Caught up. Promote, or wait for the append scan when
                // followers are mid-stream at an earlier offset.
                match self.tracker.try_promote(&rel, id, cursor, now) {
                    Ok(true) => {
                        info!("session {} now follows {}", id, rel);
                        self.enqueue_status(id, Some(&rel), StreamStatus::Complete, None);
                        self.downloads.swap_remove(i);
                    }
                    Ok(false) => i += 1,
                    Err(e) => {
                        warn!("promotion of {} failed: {e:#}", rel);
                        self.enqueue_status(id, Some(&rel), StreamStatus::Failed, None);
                        self.downloads.swap_remove(i);
                    }
                }
                continue;
            }
            let frame = match wire::encode_block(&rel, cursor, &data, self.compress) {
                Ok(f) => f,
                Err(e) => {
                    error!("compress block {} @{}: {e:#}", rel, cursor);
                    i += 1;
                    continue;
                }
            };
            self.enqueue(id, &frame);
            self.downloads[i].cursor = cursor + data.len() as u64;
            i += 1;
        }
    }
}

/// Run the source-side daemon until the task is dropped.
pub async fn serve(cfg: ServerConfig) -> Result<()> {
    let root = cfg
        .root
        .canonicalize()
        .with_context(|| format!("shared root {}", cfg.root.display()))?;
    let filter = ScanFilter::new(&cfg.include, None)?;
    let tracker = Tracker::new(root.clone(), filter, cfg.checksums);
    let engine = Arc::new(Mutex::new(Engine::new(tracker, cfg.compress)));

    let listener = TcpListener::bind(("0.0.0.0", cfg.port))
        .await
        .with_context(|| format!("bind port {}", cfg.port))?;
    info!(
        "serving {} on port {} (compress={}, checksums={})",
        root.display(),
        cfg.port,
        cfg.compress,
        cfg.checksums
    );

    let shutdown = Arc::new(Notify::new());
    let _guard = ShutdownGuard::new(shutdown.clone());
    let mut ticker = tokio::time::interval(Duration::from_millis(TICK_MS));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut next_id: SessionId = 1;
    loop {
        tokio::select! {
            _ = ticker.tick() => engine.lock().tick(Instant::now()),
            conn = listener.accept() => match conn {
                Ok((stream, peer)) => {
                    let id = next_id;
                    next_id += 1;
                    spawn_session(engine.clone(), shutdown.clone(), id, stream, peer);
                }
                Err(e) => warn!("accept failed: {e}"),
            },
        }
    }
}

fn spawn_session(
    engine: Arc<Mutex<Engine>>,
    shutdown: Arc<Notify>,
    id: SessionId,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let (rd, wr) = stream.into_split();
    let wbuf = Arc::new(Mutex::new(IoBuffer::new(SESSION_BUFFER)));
    let wnotify = Arc::new(Notify::new());
    engine.lock().sessions.insert(
        id,
        Session {
            peer,
            wbuf: wbuf.clone(),
            wnotify: wnotify.clone(),
        },
    );
    info!("session {} connected from {}", id, peer);
    tokio::spawn(session_writer(
        engine.clone(),
        shutdown.clone(),
        id,
        wr,
        wbuf,
        wnotify,
    ));
    tokio::spawn(session_reader(engine, shutdown, id, rd));
}

async fn session_writer(
    engine: Arc<Mutex<Engine>>,
    shutdown: Arc<Notify>,
    id: SessionId,
    mut wr: OwnedWriteHalf,
    wbuf: Arc<Mutex<IoBuffer>>,
    wnotify: Arc<Notify>,
) {
    loop {
        let chunk = { wbuf.lock().get(NETWORK_BLOCK) };
        if chunk.is_empty() {
            if !engine.lock().sessions.contains_key(&id) {
                return;
            }
            tokio::select! {
                _ = wnotify.notified() => {}
                _ = shutdown.notified() => return,
            }
            continue;
        }
        if let Err(e) = wr.write_all(&chunk).await {
            debug!("session {} write failed: {e}", id);
            engine.lock().remove_session(id);
            return;
        }
    }
}

async fn session_reader(
    engine: Arc<Mutex<Engine>>,
    shutdown: Arc<Notify>,
    id: SessionId,
    mut rd: OwnedReadHalf,
) {
    let mut rbuf = IoBuffer::new(SESSION_BUFFER);
    let mut sock = vec![0u8; NETWORK_BLOCK];
    loop {
        let n = tokio::select! {
            r = rd.read(&mut sock) => match r {
                Ok(0) => {
                    engine.lock().remove_session(id);
                    return;
                }
                Ok(n) => n,
                Err(e) => {
                    debug!("session {} read failed: {e}", id);
                    engine.lock().remove_session(id);
                    return;
                }
            },
            _ = shutdown.notified() => return,
        };
        rbuf.add(&sock[..n]);
        loop {
            match decode_frame(&mut rbuf) {
                Ok(Decoded::Frame(frame)) => {
                    let req = Request::from_frame(&frame);
                    engine.lock().handle_request(id, req);
                }
                Ok(Decoded::Incomplete) => break,
                Ok(Decoded::Malformed) => {
                    error!("session {}: unparseable request header", id);
                    engine.lock().reply_bad_request(id);
                }
                Err(e) => {
                    error!("session {}: {e:#}", id);
                    engine.lock().remove_session(id);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write as _;
    use tempfile::TempDir;

    fn test_engine(root: &TempDir, compress: bool, checksums: bool) -> Engine {
        let tracker = Tracker::new(
            root.path().to_path_buf(),
            ScanFilter::new(".*", None).unwrap(),
            checksums,
        );
        Engine::new(tracker, compress)
    }

    fn fake_session(engine: &mut Engine, id: SessionId) -> Arc<Mutex<IoBuffer>> {
        let wbuf = Arc::new(Mutex::new(IoBuffer::new(SESSION_BUFFER)));
        engine.sessions.insert(
            id,
            Session {
                peer: "127.0.0.1:0".parse().unwrap(),
                wbuf: wbuf.clone(),
                wnotify: Arc::new(Notify::new()),
            },
        );
        wbuf
    }

    fn drain_packets(wbuf: &Arc<Mutex<IoBuffer>>) -> Vec<wire::Packet> {
        let mut out = Vec::new();
        let mut buf = wbuf.lock();
        loop {
            match decode_frame(&mut buf) {
                Ok(Decoded::Frame(f)) => out.push(wire::Packet::from_frame(f).unwrap()),
                Ok(Decoded::Incomplete) => break,
                other => panic!("{other:?}"),
            }
        }
        out
    }

    #[test]
    fn download_streams_file_then_promotes() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.log"), "0123456789").unwrap();
        let mut engine = test_engine(&tmp, false, false);
        let wbuf = fake_session(&mut engine, 1);

        let now = Instant::now();
        engine.tick(now);
        drain_packets(&wbuf); // discovery delta

        engine.handle_request(
            1,
            Request::Stream {
                path: Some("a.log".into()),
                offset: 0,
            },
        );
        // One block per download per tick; EOF is seen on the tick after
        // the last block.
        for _ in 0..10 {
            engine.tick(now);
            if engine.downloads.is_empty() {
                break;
            }
        }

        let packets = drain_packets(&wbuf);
        let mut got_in_progress = false;
        let mut bytes = Vec::new();
        let mut got_complete = false;
        for p in packets {
            match p {
                wire::Packet::Status { status: StreamStatus::InProgress, .. } => {
                    got_in_progress = true;
                }
                wire::Packet::Block { path, offset, data } => {
                    assert_eq!(path, "a.log");
                    assert_eq!(offset as usize, bytes.len());
                    bytes.extend_from_slice(&data);
                }
                wire::Packet::Status { status: StreamStatus::Complete, .. } => {
                    got_complete = true;
                }
                other => panic!("{other:?}"),
            }
        }
        assert!(got_in_progress);
        assert!(got_complete);
        assert_eq!(bytes, b"0123456789");
        assert_eq!(engine.tracker.subscribers_of("a.log"), vec![1]);
        assert!(engine.downloads.is_empty());
    }

    #[test]
    fn appends_fan_out_to_all_followers() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.log");
        fs::write(&path, "start").unwrap();
        let mut engine = test_engine(&tmp, false, false);
        let w1 = fake_session(&mut engine, 1);
        let w2 = fake_session(&mut engine, 2);

        let now = Instant::now();
        engine.tick(now);
        engine.tracker.try_promote("a.log", 1, 5, now).unwrap();
        engine.tracker.try_promote("a.log", 2, 5, now).unwrap();
        drain_packets(&w1);
        drain_packets(&w2);

        let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"-more").unwrap();
        drop(f);
        engine.scan_new_data(now);

        for wbuf in [&w1, &w2] {
            let packets = drain_packets(wbuf);
            assert_eq!(packets.len(), 1);
            match &packets[0] {
                wire::Packet::Block { offset, data, .. } => {
                    assert_eq!(*offset, 5);
                    assert_eq!(data, b"-more");
                }
                other => panic!("{other:?}"),
            }
        }
        assert_eq!(engine.tracker.get("a.log").unwrap().read_cursor, 10);
    }

    #[test]
    fn full_follower_buffer_holds_the_cursor() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.log");
        fs::write(&path, "start").unwrap();
        let mut engine = test_engine(&tmp, false, false);
        let w1 = fake_session(&mut engine, 1);
        let w2 = fake_session(&mut engine, 2);

        let now = Instant::now();
        engine.tick(now);
        engine.tracker.try_promote("a.log", 1, 5, now).unwrap();
        engine.tracker.try_promote("a.log", 2, 5, now).unwrap();
        drain_packets(&w1);
        drain_packets(&w2);

        // Leave follower 2 with less than a block of room.
        let filler = vec![0u8; SESSION_BUFFER - FS_BLOCK];
        w2.lock().add(&filler);

        let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"-more").unwrap();
        drop(f);
        engine.scan_new_data(now);

        assert!(drain_packets(&w1).is_empty());
        assert_eq!(engine.tracker.get("a.log").unwrap().read_cursor, 5);

        // Draining the slow follower lets the next round deliver.
        let len = w2.lock().len();
        w2.lock().get(len);
        engine.scan_new_data(now);
        assert_eq!(drain_packets(&w1).len(), 1);
        assert_eq!(drain_packets(&w2).len(), 1);
        assert_eq!(engine.tracker.get("a.log").unwrap().read_cursor, 10);
    }

    #[test]
    fn truncation_fails_followers_and_downloads() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.log");
        fs::write(&path, "0123456789abc").unwrap();
        let mut engine = test_engine(&tmp, false, false);
        let wbuf = fake_session(&mut engine, 1);

        let now = Instant::now();
        engine.tick(now);
        engine.tracker.try_promote("a.log", 1, 13, now).unwrap();
        drain_packets(&wbuf);

        fs::write(&path, "xyz").unwrap();
        engine.tick(now);

        let packets = drain_packets(&wbuf);
        let mut got_fail = false;
        let mut delta_size = None;
        for p in packets {
            match p {
                wire::Packet::Status { path, status: StreamStatus::Failed, .. } => {
                    assert_eq!(path.as_deref(), Some("a.log"));
                    got_fail = true;
                }
                wire::Packet::List { full: false, entries } => {
                    delta_size = Some(entries["a.log"].s);
                }
                other => panic!("{other:?}"),
            }
        }
        assert!(got_fail);
        assert_eq!(delta_size, Some(3));
        assert!(engine.tracker.subscribers_of("a.log").is_empty());
    }

    #[test]
    fn list_request_returns_full_snapshot() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.log"), "0123456789").unwrap();
        let mut engine = test_engine(&tmp, false, false);
        let wbuf = fake_session(&mut engine, 1);

        engine.tick(Instant::now());
        drain_packets(&wbuf);
        engine.handle_request(1, Request::List);
        let packets = drain_packets(&wbuf);
        match &packets[0] {
            wire::Packet::List { full: true, entries } => {
                assert_eq!(entries["a.log"].s, 10);
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn stream_for_untracked_path_fails() {
        let tmp = TempDir::new().unwrap();
        let mut engine = test_engine(&tmp, false, false);
        let wbuf = fake_session(&mut engine, 1);

        engine.handle_request(
            1,
            Request::Stream {
                path: Some("nope.log".into()),
                offset: 0,
            },
        );
        let packets = drain_packets(&wbuf);
        assert!(matches!(
            &packets[0],
            wire::Packet::Status { status: StreamStatus::Failed, path: Some(p), .. } if p == "nope.log"
        ));
        assert!(engine.downloads.is_empty());
    }

    #[test]
    fn reserved_block_verb_fails_and_unknown_errors() {
        let tmp = TempDir::new().unwrap();
        let mut engine = test_engine(&tmp, false, false);
        let wbuf = fake_session(&mut engine, 1);

        engine.handle_request(1, Request::Block { path: None });
        engine.handle_request(1, Request::Unknown("FETCH".into()));
        let packets = drain_packets(&wbuf);
        assert!(matches!(
            packets[0],
            wire::Packet::Status { status: StreamStatus::Failed, .. }
        ));
        assert!(matches!(
            &packets[1],
            wire::Packet::Status { status: StreamStatus::Error, message: Some(m), .. }
                if m == "unknown request"
        ));
    }

    #[test]
    fn resumed_download_skips_existing_prefix() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.log"), "0123456789abcdef").unwrap();
        let mut engine = test_engine(&tmp, false, false);
        let wbuf = fake_session(&mut engine, 1);

        let now = Instant::now();
        engine.tick(now);
        drain_packets(&wbuf);
        engine.handle_request(
            1,
            Request::Stream {
                path: Some("a.log".into()),
                offset: 13,
            },
        );
        for _ in 0..10 {
            engine.tick(now);
            if engine.downloads.is_empty() {
                break;
            }
        }

        let packets = drain_packets(&wbuf);
        let mut bytes = Vec::new();
        for p in &packets {
            if let wire::Packet::Block { offset, data, .. } = p {
                assert_eq!(*offset, 13 + bytes.len() as u64);
                bytes.extend_from_slice(data);
            }
        }
        assert_eq!(bytes, b"def");
    }

    #[test]
    fn session_teardown_sweeps_state() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.log"), "abcdef").unwrap();
        let mut engine = test_engine(&tmp, false, false);
        fake_session(&mut engine, 1);

        let now = Instant::now();
        engine.tick(now);
        engine.tracker.try_promote("a.log", 1, 6, now).unwrap();
        engine.downloads.push(Download {
            session: 1,
            rel: "a.log".into(),
            cursor: 0,
        });
        engine.remove_session(1);
        assert!(engine.sessions.is_empty());
        assert!(engine.downloads.is_empty());
        assert!(engine.tracker.subscribers_of("a.log").is_empty());
    }
}
