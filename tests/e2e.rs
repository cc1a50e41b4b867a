//! End-to-end convergence scenarios: a real server and client over
//! loopback TCP, temp directories on both sides.

use anyhow::Result;
use rstream::client::{self, ClientConfig};
use rstream::server::{self, ServerConfig};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task::JoinHandle;

fn free_port() -> u16 {
    let sock = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = sock.local_addr().unwrap().port();
    drop(sock);
    port
}

fn start_server(root: &Path, port: u16, compress: bool, checksums: bool) -> JoinHandle<Result<()>> {
    let cfg = ServerConfig {
        port,
        root: root.to_path_buf(),
        include: ".*".to_string(),
        compress,
        checksums,
    };
    tokio::spawn(server::serve(cfg))
}

fn start_client(dir: &Path, port: u16) -> JoinHandle<Result<()>> {
    let cfg = ClientConfig {
        port,
        dir: dir.to_path_buf(),
        sources: vec!["127.0.0.1".to_string()],
        echo_stdout: false,
    };
    tokio::spawn(client::run(cfg))
}

async fn wait_accepting(port: u16) {
    for _ in 0..100u32 {
        if tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .is_ok()
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("server on port {port} never started accepting");
}

async fn wait_for_bytes(path: &Path, expected: &[u8], secs: u64) -> bool {
    let rounds = secs * 20;
    for _ in 0..rounds {
        if std::fs::read(path).map(|b| b == expected).unwrap_or(false) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

async fn wait_for_absence(path: &Path, secs: u64) -> bool {
    let rounds = secs * 20;
    for _ in 0..rounds {
        if !path.exists() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

fn append(path: &Path, data: &[u8]) {
    let mut f = std::fs::OpenOptions::new().append(true).open(path).unwrap();
    f.write_all(data).unwrap();
}

fn bump_mtime(path: &Path, secs_forward: i64) {
    let md = std::fs::metadata(path).unwrap();
    let old = filetime::FileTime::from_last_modification_time(&md);
    filetime::set_file_mtime(
        path,
        filetime::FileTime::from_unix_time(old.unix_seconds() + secs_forward, 0),
    )
    .unwrap();
}

fn mirror_path(dst: &Path, rel: &str) -> PathBuf {
    dst.join("127.0.0.1").join(rel)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn plain_append_replicates() -> Result<()> {
    let src = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    std::fs::write(src.path().join("a.log"), "0123456789")?;

    let port = free_port();
    let server = start_server(src.path(), port, false, false);
    wait_accepting(port).await;
    let client = start_client(dst.path(), port);

    let target = mirror_path(dst.path(), "a.log");
    assert!(wait_for_bytes(&target, b"0123456789", 15).await);

    append(&src.path().join("a.log"), b"abc");
    assert!(wait_for_bytes(&target, b"0123456789abc", 15).await);

    server.abort();
    client.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn truncation_resets_the_mirror() -> Result<()> {
    let src = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    std::fs::write(src.path().join("a.log"), "0123456789")?;

    let port = free_port();
    let server = start_server(src.path(), port, false, false);
    wait_accepting(port).await;
    let client = start_client(dst.path(), port);

    let target = mirror_path(dst.path(), "a.log");
    assert!(wait_for_bytes(&target, b"0123456789", 15).await);
    append(&src.path().join("a.log"), b"abc");
    assert!(wait_for_bytes(&target, b"0123456789abc", 15).await);

    // Rewrite smaller: size shrinks from 13 to 3.
    std::fs::write(src.path().join("a.log"), "xyz")?;
    assert!(wait_for_bytes(&target, b"xyz", 15).await);

    server.abort();
    client.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_size_replacement_detected_by_digest() -> Result<()> {
    let src = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    std::fs::write(src.path().join("a.log"), "0123456789")?;

    let port = free_port();
    let server = start_server(src.path(), port, false, true);
    wait_accepting(port).await;
    let client = start_client(dst.path(), port);

    let target = mirror_path(dst.path(), "a.log");
    assert!(wait_for_bytes(&target, b"0123456789", 15).await);

    // Same length, different bytes; push the mtime clearly forward.
    std::fs::write(src.path().join("a.log"), "9876543210")?;
    bump_mtime(&src.path().join("a.log"), 5);
    assert!(wait_for_bytes(&target, b"9876543210", 15).await);

    server.abort();
    client.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deletion_propagates() -> Result<()> {
    let src = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    std::fs::write(src.path().join("a.log"), "0123456789")?;
    std::fs::write(src.path().join("keep.log"), "keep")?;

    let port = free_port();
    let server = start_server(src.path(), port, false, false);
    wait_accepting(port).await;
    let client = start_client(dst.path(), port);

    let target = mirror_path(dst.path(), "a.log");
    assert!(wait_for_bytes(&target, b"0123456789", 15).await);
    assert!(wait_for_bytes(&mirror_path(dst.path(), "keep.log"), b"keep", 15).await);

    std::fs::remove_file(src.path().join("a.log"))?;
    assert!(wait_for_absence(&target, 15).await);
    // The sibling is untouched.
    assert_eq!(std::fs::read(mirror_path(dst.path(), "keep.log"))?, b"keep");

    server.abort();
    client.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reconnect_resumes_from_local_offset() -> Result<()> {
    let src = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    std::fs::write(src.path().join("a.log"), "0123456789")?;

    let port = free_port();
    let server = start_server(src.path(), port, false, false);
    wait_accepting(port).await;
    let client = start_client(dst.path(), port);

    let target = mirror_path(dst.path(), "a.log");
    assert!(wait_for_bytes(&target, b"0123456789", 15).await);
    append(&src.path().join("a.log"), b"abc");
    assert!(wait_for_bytes(&target, b"0123456789abc", 15).await);

    // Kill the source, append while it is down, bring it back.
    server.abort();
    tokio::time::sleep(Duration::from_millis(300)).await;
    append(&src.path().join("a.log"), b"def");
    let server = start_server(src.path(), port, false, false);
    wait_accepting(port).await;

    // The client reconnects within its fixed backoff and fetches only the
    // missing suffix (the request carries its local size as the offset).
    assert!(wait_for_bytes(&target, b"0123456789abcdef", 30).await);

    server.abort();
    client.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restart_with_smaller_file_converges() -> Result<()> {
    let src = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    std::fs::write(src.path().join("a.log"), "0123456789abcdef")?;

    let port = free_port();
    let server = start_server(src.path(), port, false, false);
    wait_accepting(port).await;
    let client = start_client(dst.path(), port);

    let target = mirror_path(dst.path(), "a.log");
    assert!(wait_for_bytes(&target, b"0123456789abcdef", 15).await);

    // The source is rewritten shorter while down. The client's resumed
    // offset overshoots, the stream is refused, and the file restarts
    // from zero.
    server.abort();
    tokio::time::sleep(Duration::from_millis(300)).await;
    std::fs::write(src.path().join("a.log"), "xyz")?;
    let server = start_server(src.path(), port, false, false);
    wait_accepting(port).await;

    assert!(wait_for_bytes(&target, b"xyz", 30).await);

    server.abort();
    client.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn nested_tree_and_new_files_converge() -> Result<()> {
    let src = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    std::fs::create_dir_all(src.path().join("web/access"))?;
    std::fs::write(src.path().join("web/access/one.log"), "one")?;
    std::fs::write(src.path().join("empty.log"), "")?;

    let port = free_port();
    let server = start_server(src.path(), port, false, false);
    wait_accepting(port).await;
    let client = start_client(dst.path(), port);

    assert!(wait_for_bytes(&mirror_path(dst.path(), "web/access/one.log"), b"one", 15).await);
    assert!(wait_for_bytes(&mirror_path(dst.path(), "empty.log"), b"", 15).await);

    // A file born after the client connected is picked up via the delta
    // list.
    std::fs::write(src.path().join("web/late.log"), "late")?;
    assert!(wait_for_bytes(&mirror_path(dst.path(), "web/late.log"), b"late", 15).await);

    server.abort();
    client.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn compressed_blocks_converge() -> Result<()> {
    let src = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    let body: Vec<u8> = b"abcdefgh".iter().cycle().take(40_000).copied().collect();
    std::fs::write(src.path().join("big.log"), &body)?;

    let port = free_port();
    let server = start_server(src.path(), port, true, false);
    wait_accepting(port).await;
    let client = start_client(dst.path(), port);

    assert!(wait_for_bytes(&mirror_path(dst.path(), "big.log"), &body, 15).await);

    append(&src.path().join("big.log"), b"tail");
    let mut expected = body;
    expected.extend_from_slice(b"tail");
    assert!(wait_for_bytes(&mirror_path(dst.path(), "big.log"), &expected, 15).await);

    server.abort();
    client.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn include_regex_limits_the_share() -> Result<()> {
    let src = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    std::fs::write(src.path().join("a.log"), "wanted")?;
    std::fs::write(src.path().join("scratch.tmp"), "unwanted")?;

    let port = free_port();
    let cfg = ServerConfig {
        port,
        root: src.path().to_path_buf(),
        include: r"\.log$".to_string(),
        compress: false,
        checksums: false,
    };
    let server = tokio::spawn(server::serve(cfg));
    wait_accepting(port).await;
    let client = start_client(dst.path(), port);

    assert!(wait_for_bytes(&mirror_path(dst.path(), "a.log"), b"wanted", 15).await);
    assert!(!mirror_path(dst.path(), "scratch.tmp").exists());

    server.abort();
    client.abort();
    Ok(())
}
