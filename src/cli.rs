//! Invocation surface shared by the two engine roles.

use clap::{ArgAction, Parser};
use std::path::PathBuf;

use crate::protocol::DEFAULT_PORT;

/// One binary, two roles: `-l` serves a directory to connecting targets;
/// without it, the positional source hosts are mirrored into the working
/// directory.
#[derive(Debug, Parser)]
#[command(
    name = "rstream",
    version,
    about = "Replicates growing files from source hosts to targets in near real time"
)]
pub struct Args {
    /// Server mode: share the directory root with connecting targets
    #[arg(short = 'l')]
    pub listen: bool,

    /// TCP port (server: listen; client: connect)
    #[arg(short = 'P', default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Shared root (server) or working directory (client)
    #[arg(short = 'd', default_value = ".")]
    pub dir: PathBuf,

    /// Include regex applied to file names under the shared root
    #[arg(short = 'r', default_value = ".*")]
    pub include: String,

    /// Client: also copy received bytes to standard output
    #[arg(short = 's')]
    pub stdout_copy: bool,

    /// Server: gzip block payloads
    #[arg(short = 'z')]
    pub compress: bool,

    /// Server: compute and advertise SHA-1 digests
    #[arg(short = 'c')]
    pub checksums: bool,

    /// Pid file path
    #[arg(short = 'p', default_value = "/var/run/rstream.pid")]
    pub pid_file: PathBuf,

    /// Stay in the foreground
    #[arg(short = 'f')]
    pub foreground: bool,

    /// Increase verbosity (repeatable)
    #[arg(short = 'v', action = ArgAction::Count)]
    pub verbose: u8,

    /// Source hostnames (client mode); each undergoes brace permutation
    pub sources: Vec<String>,
}

/// Expand shell-style `{a,b}` alternations, recursively, left to right.
/// Patterns without braces (or with unbalanced ones) pass through as-is.
pub fn brace_expand(pattern: &str) -> Vec<String> {
    let Some(open) = pattern.find('{') else {
        return vec![pattern.to_string()];
    };
    let mut depth = 0usize;
    let mut close = None;
    for (i, ch) in pattern.char_indices().skip(open) {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    close = Some(i);
                    break;
                }
            }
            _ => {}
        }
    }
    let Some(close) = close else {
        return vec![pattern.to_string()];
    };
    let head = &pattern[..open];
    let body = &pattern[open + 1..close];
    let rest = &pattern[close + 1..];

    let mut alternatives = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, ch) in body.char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => depth -= 1,
            ',' if depth == 0 => {
                alternatives.push(&body[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    alternatives.push(&body[start..]);

    let mut out = Vec::new();
    for alt in alternatives {
        for tail in brace_expand(&format!("{alt}{rest}")) {
            out.push(format!("{head}{tail}"));
        }
    }
    out
}

/// Brace-expand every positional host argument, deduplicating while
/// preserving order.
pub fn expand_sources(args: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for arg in args {
        for host in brace_expand(arg) {
            if seen.insert(host.clone()) {
                out.push(host);
            }
        }
    }
    out
}
