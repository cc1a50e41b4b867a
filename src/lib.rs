//! rstream library
//!
//! Near-real-time replication of append-heavy file trees. One binary, two
//! roles: a source-side daemon that tracks files under a shared root and
//! fans out appends to connected targets over a framed TCP protocol, and
//! a target-side follower that mirrors each source under a subdirectory
//! of its working directory, resuming from persisted offsets across
//! restarts.

pub mod cli;
pub mod client;
pub mod daemon;
pub mod iobuf;
pub mod protocol;
pub mod resume;
pub mod scanner;
pub mod server;
pub mod tracker;
pub mod wire;
