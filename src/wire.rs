//! Framed wire protocol: a flat JSON header followed by an opaque payload.
//!
//! A message is one JSON object terminated by the first `}` (headers never
//! nest), immediately followed by the number of payload bytes named in the
//! `s` field. Requests carry a `cmd` verb (`LIST`, `STREAM`, reserved
//! `BLOCK`); pushes carry a packet kind `p` (`l` full list, `lp` partial
//! list, `b` block, `s` stream status). Numeric fields are quoted on the
//! wire; bare numbers are accepted on decode for tolerance. A list payload
//! maps relative path to `{s, c?}` where `s:"-1"` tombstones a deleted
//! path. Block payloads are gzip-compressed iff `z:"1"`.
//!
//! The reserved `BLOCK` verb is answered with `p:"s", st:4` (fail) rather
//! than silently dropped.

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};

use crate::iobuf::IoBuffer;
use crate::protocol::MAX_HEADER;

/// List-update size marking a deleted path.
pub const TOMBSTONE: i64 = -1;

/// `st` codes carried on the wire. `Error` doubles as the reply to
/// unparseable or unknown requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Error,
    Ok,
    InProgress,
    Complete,
    Failed,
}

impl StreamStatus {
    pub fn code(self) -> i64 {
        match self {
            StreamStatus::Error => 0,
            StreamStatus::Ok => 1,
            StreamStatus::InProgress => 2,
            StreamStatus::Complete => 3,
            StreamStatus::Failed => 4,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(StreamStatus::Error),
            1 => Some(StreamStatus::Ok),
            2 => Some(StreamStatus::InProgress),
            3 => Some(StreamStatus::Complete),
            4 => Some(StreamStatus::Failed),
            _ => None,
        }
    }
}

/// Integers serialized as quoted strings, deserialized from either form.
mod quoted {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn to_i64<E: serde::de::Error>(v: serde_json::Value) -> Result<i64, E> {
        match v {
            serde_json::Value::String(s) => s
                .trim()
                .parse()
                .map_err(|_| E::custom(format!("not an integer: {s:?}"))),
            serde_json::Value::Number(n) => {
                n.as_i64().ok_or_else(|| E::custom("integer out of range"))
            }
            other => Err(E::custom(format!("expected integer, got {other}"))),
        }
    }

    pub mod required {
        use super::*;

        pub fn serialize<S: Serializer>(v: &i64, s: S) -> Result<S::Ok, S::Error> {
            s.serialize_str(&v.to_string())
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
            to_i64(serde_json::Value::deserialize(d)?)
        }
    }

    pub mod optional {
        use super::*;

        pub fn serialize<S: Serializer>(v: &Option<i64>, s: S) -> Result<S::Ok, S::Error> {
            match v {
                Some(n) => s.serialize_str(&n.to_string()),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
            match Option::<serde_json::Value>::deserialize(d)? {
                None => Ok(None),
                Some(v) => to_i64(v).map(Some),
            }
        }
    }
}

/// Raw frame header; field names match the wire format.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Header {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub f: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "quoted::optional")]
    pub o: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "quoted::optional")]
    pub s: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "quoted::optional")]
    pub st: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub c: Option<String>,
}

/// One entry of a list update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListEntry {
    #[serde(with = "quoted::required")]
    pub s: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub c: Option<String>,
}

/// Relative path to size/digest, ordered for deterministic encodes.
pub type ListUpdate = BTreeMap<String, ListEntry>;

/// A decoded header plus its opaque payload.
#[derive(Debug)]
pub struct Frame {
    pub header: Header,
    pub payload: Vec<u8>,
}

/// Result of one decode attempt against a read buffer.
#[derive(Debug)]
pub enum Decoded {
    /// A complete frame was consumed.
    Frame(Frame),
    /// Not enough bytes yet; buffer untouched (or header pushed back).
    Incomplete,
    /// A header arrived but did not parse; its bytes were consumed so the
    /// caller can answer and resynchronize.
    Malformed,
}

/// Encode a header and payload into one wire message. The header's `s`
/// field is set from the payload length.
pub fn encode_frame(mut header: Header, payload: &[u8]) -> Result<Vec<u8>> {
    header.s = if payload.is_empty() {
        None
    } else {
        Some(payload.len() as i64)
    };
    let mut out = serde_json::to_vec(&header).context("encode frame header")?;
    out.extend_from_slice(payload);
    Ok(out)
}

/// Pull one frame off `buf`. An error means the stream cannot be
/// resynchronized and the session should be closed.
pub fn decode_frame(buf: &mut IoBuffer) -> Result<Decoded> {
    let close = match buf.peek().iter().position(|&b| b == b'}') {
        Some(i) => i,
        None => {
            if buf.len() > MAX_HEADER {
                bail!("no header terminator within {} bytes", MAX_HEADER);
            }
            return Ok(Decoded::Incomplete);
        }
    };
    if close + 1 > MAX_HEADER {
        bail!("frame header exceeds {} bytes", MAX_HEADER);
    }
    let hdr_bytes = buf.get(close + 1);
    let header: Header = match serde_json::from_slice(&hdr_bytes) {
        Ok(h) => h,
        Err(_) => return Ok(Decoded::Malformed),
    };
    let want = header.s.unwrap_or(0);
    if want < 0 {
        return Ok(Decoded::Malformed);
    }
    let want = want as usize;
    if buf.len() < want {
        buf.push_front(&hdr_bytes);
        return Ok(Decoded::Incomplete);
    }
    let payload = buf.get(want);
    Ok(Decoded::Frame(Frame { header, payload }))
}

/// Client-to-server request verbs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    List,
    Stream { path: Option<String>, offset: u64 },
    /// Reserved verb; the server answers with a failed stream status.
    Block { path: Option<String> },
    Unknown(String),
}

impl Request {
    pub fn from_frame(frame: &Frame) -> Request {
        match frame.header.cmd.as_deref() {
            Some("LIST") => Request::List,
            Some("STREAM") => Request::Stream {
                path: frame.header.f.clone(),
                offset: frame.header.o.unwrap_or(0).max(0) as u64,
            },
            Some("BLOCK") => Request::Block {
                path: frame.header.f.clone(),
            },
            Some(other) => Request::Unknown(other.to_string()),
            None => Request::Unknown(String::new()),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let header = match self {
            Request::List => Header {
                cmd: Some("LIST".into()),
                ..Header::default()
            },
            Request::Stream { path, offset } => Header {
                cmd: Some("STREAM".into()),
                f: path.clone(),
                o: Some(*offset as i64),
                ..Header::default()
            },
            Request::Block { path } => Header {
                cmd: Some("BLOCK".into()),
                f: path.clone(),
                ..Header::default()
            },
            Request::Unknown(v) => Header {
                cmd: Some(v.clone()),
                ..Header::default()
            },
        };
        encode_frame(header, &[])
    }
}

/// Server-to-client push packets.
#[derive(Debug)]
pub enum Packet {
    /// Full (`l`) or partial (`lp`) list update.
    List { full: bool, entries: ListUpdate },
    /// A contiguous segment of file bytes, already decompressed.
    Block {
        path: String,
        offset: u64,
        data: Vec<u8>,
    },
    /// Stream status transition, or a general error when `status` is
    /// `Error`.
    Status {
        path: Option<String>,
        status: StreamStatus,
        message: Option<String>,
    },
}

impl Packet {
    pub fn from_frame(frame: Frame) -> Result<Packet> {
        match frame.header.p.as_deref() {
            Some(kind @ ("l" | "lp")) => {
                let entries: ListUpdate = serde_json::from_slice(&frame.payload)
                    .context("parse list payload")?;
                Ok(Packet::List {
                    full: kind == "l",
                    entries,
                })
            }
            Some("b") => {
                let path = frame.header.f.clone().context("block without f")?;
                let offset = frame.header.o.context("block without o")?.max(0) as u64;
                let data = if frame.header.z.as_deref() == Some("1") {
                    gunzip(&frame.payload).context("decompress block")?
                } else {
                    frame.payload
                };
                Ok(Packet::Block { path, offset, data })
            }
            Some("s") => {
                let code = frame.header.st.unwrap_or(0);
                let status = StreamStatus::from_code(code)
                    .with_context(|| format!("unknown stream state {code}"))?;
                let message = if frame.payload.is_empty() {
                    None
                } else {
                    Some(String::from_utf8_lossy(&frame.payload).into_owned())
                };
                Ok(Packet::Status {
                    path: frame.header.f.clone(),
                    status,
                    message,
                })
            }
            Some(other) => bail!("unknown packet kind {other:?}"),
            None => bail!("packet without kind"),
        }
    }
}

/// Encode a list update. Full lists carry `st:1` per the protocol.
pub fn encode_list(full: bool, entries: &ListUpdate) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(entries).context("encode list payload")?;
    let header = Header {
        p: Some(if full { "l" } else { "lp" }.into()),
        st: full.then_some(StreamStatus::Ok.code()),
        ..Header::default()
    };
    encode_frame(header, &payload)
}

/// Encode a block of file bytes at `offset`, gzipping when `compress`.
pub fn encode_block(path: &str, offset: u64, data: &[u8], compress: bool) -> Result<Vec<u8>> {
    let (payload, z) = if compress {
        (gzip(data).context("compress block")?, Some("1".to_string()))
    } else {
        (data.to_vec(), None)
    };
    let header = Header {
        p: Some("b".into()),
        f: Some(path.to_string()),
        o: Some(offset as i64),
        z,
        ..Header::default()
    };
    encode_frame(header, &payload)
}

/// Encode a stream status, with an optional short text payload.
pub fn encode_status(path: Option<&str>, status: StreamStatus, message: Option<&str>) -> Result<Vec<u8>> {
    let header = Header {
        p: Some("s".into()),
        f: path.map(str::to_string),
        st: Some(status.code()),
        ..Header::default()
    };
    encode_frame(header, message.map(str::as_bytes).unwrap_or_default())
}

pub fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data)?;
    Ok(enc.finish()?)
}

pub fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}
