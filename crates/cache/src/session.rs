//! Read sessions
//!
//! A `Session` yields a signed response part by part (head, chunk headers
//! with their `ouisig` extensions, chunk bodies, trailers) whether the
//! bytes come from a peer socket or from a committed store entry. Consumers
//! (the multi-peer reader, the peer server) only ever see parts.

use base64::Engine;
use cachecraft_core::{Cancel, Error, Result};
use cachecraft_crypto::Signature;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::head::ResponseHead;
use crate::store::StoreEntry;

/// Largest accepted head, chunk-header line or trailer block.
const MAX_HEAD_BYTES: usize = 64 * 1024;
/// Largest accepted single chunk.
const MAX_CHUNK: u64 = 8 * 1024 * 1024;

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// One part of a signed response stream, in protocol order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Part {
    Head(ResponseHead),
    /// A chunk-size line; `signature` carries the `;ouisig=` extension.
    ChunkHeader { size: u64, signature: Option<Signature> },
    ChunkBody(Vec<u8>),
    Trailer(Vec<(String, String)>),
}

enum Source {
    Store { entry: StoreEntry, state: StoreState },
    Stream { io: BufReader<Box<dyn AsyncRead + Send + Unpin>>, state: StreamState },
}

enum StoreState {
    Head,
    ChunkHeader { index: u64 },
    ChunkBody { index: u64 },
    Trailer,
    Done,
}

enum StreamState {
    Head,
    ChunkHeader,
    ChunkBody { size: u64 },
    Trailer,
    Done,
}

/// An incremental reader over one signed response.
pub struct Session {
    source: Source,
}

impl Session {
    /// Read a committed store entry back as a part stream.
    pub fn from_store(entry: StoreEntry) -> Self {
        Self { source: Source::Store { entry, state: StoreState::Head } }
    }

    /// Parse a network byte stream (already positioned at the response).
    pub fn from_stream(io: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            source: Source::Stream {
                io: BufReader::new(Box::new(io)),
                state: StreamState::Head,
            },
        }
    }

    /// The next part, or `None` after the trailer.
    pub async fn next_part(&mut self, cancel: &Cancel) -> Result<Option<Part>> {
        match &mut self.source {
            Source::Store { entry, state } => store_next(entry, state),
            Source::Stream { io, state } => cancel.run(stream_next(io, state)).await?,
        }
    }
}

fn store_next(entry: &mut StoreEntry, state: &mut StoreState) -> Result<Option<Part>> {
    loop {
        match state {
            StoreState::Head => {
                *state = StoreState::ChunkHeader { index: 0 };
                return Ok(Some(Part::Head(entry.head.clone())));
            }
            StoreState::ChunkHeader { index } => {
                let index = *index;
                match entry.read_block(index)? {
                    Some(block) => {
                        *state = StoreState::ChunkBody { index };
                        return Ok(Some(Part::ChunkHeader {
                            size: block.data.len() as u64,
                            signature: Some(block.signature),
                        }));
                    }
                    None => {
                        *state = StoreState::Trailer;
                        return Ok(Some(Part::ChunkHeader { size: 0, signature: None }));
                    }
                }
            }
            StoreState::ChunkBody { index } => {
                let index = *index;
                let block = entry
                    .read_block(index)?
                    .ok_or_else(|| Error::StoreCorruption("block vanished mid-read".into()))?;
                *state = StoreState::ChunkHeader { index: index + 1 };
                return Ok(Some(Part::ChunkBody(block.data)));
            }
            StoreState::Trailer => {
                *state = StoreState::Done;
                return Ok(Some(Part::Trailer(entry.trailers())));
            }
            StoreState::Done => return Ok(None),
        }
    }
}

async fn stream_next(
    io: &mut BufReader<Box<dyn AsyncRead + Send + Unpin>>,
    state: &mut StreamState,
) -> Result<Option<Part>> {
    match state {
        StreamState::Head => {
            let raw = read_until_blank_line(io).await?;
            let (head, _) = ResponseHead::parse(&raw)?;
            *state = StreamState::ChunkHeader;
            Ok(Some(Part::Head(head)))
        }
        StreamState::ChunkHeader => {
            let line = read_line(io).await?;
            let (size, signature) = parse_chunk_header(&line)?;
            if size == 0 {
                *state = StreamState::Trailer;
            } else {
                *state = StreamState::ChunkBody { size };
            }
            Ok(Some(Part::ChunkHeader { size, signature }))
        }
        StreamState::ChunkBody { size } => {
            let size = *size;
            if size > MAX_CHUNK {
                return Err(Error::protocol("chunk too large"));
            }
            let mut data = vec![0u8; size as usize];
            io.read_exact(&mut data).await.map_err(Error::network)?;
            let mut crlf = [0u8; 2];
            io.read_exact(&mut crlf).await.map_err(Error::network)?;
            if &crlf != b"\r\n" {
                return Err(Error::protocol("chunk body not CRLF-terminated"));
            }
            *state = StreamState::ChunkHeader;
            Ok(Some(Part::ChunkBody(data)))
        }
        StreamState::Trailer => {
            let mut trailers = Vec::new();
            loop {
                let line = read_line(io).await?;
                if line.is_empty() {
                    break;
                }
                let (name, value) = line
                    .split_once(':')
                    .ok_or_else(|| Error::protocol("malformed trailer line"))?;
                trailers.push((name.trim().to_string(), value.trim().to_string()));
            }
            *state = StreamState::Done;
            Ok(Some(Part::Trailer(trailers)))
        }
        StreamState::Done => Ok(None),
    }
}

/// Write a part in wire form.
pub async fn write_part<W: AsyncWrite + Unpin>(w: &mut W, part: &Part) -> Result<()> {
    match part {
        Part::Head(head) => w.write_all(&head.to_bytes()).await?,
        Part::ChunkHeader { size, signature } => {
            let line = match signature {
                Some(sig) => format!("{size:x};ouisig={}\r\n", B64.encode(sig)),
                None => format!("{size:x}\r\n"),
            };
            w.write_all(line.as_bytes()).await?;
        }
        Part::ChunkBody(data) => {
            w.write_all(data).await?;
            w.write_all(b"\r\n").await?;
        }
        Part::Trailer(trailers) => {
            for (name, value) in trailers {
                w.write_all(format!("{name}: {value}\r\n").as_bytes()).await?;
            }
            w.write_all(b"\r\n").await?;
        }
    }
    Ok(())
}

fn parse_chunk_header(line: &str) -> Result<(u64, Option<Signature>)> {
    let (size_part, extensions) = match line.split_once(';') {
        Some((s, e)) => (s, Some(e)),
        None => (line, None),
    };
    let size = u64::from_str_radix(size_part.trim(), 16)
        .map_err(|_| Error::protocol("bad chunk size"))?;
    let mut signature = None;
    if let Some(extensions) = extensions {
        for ext in extensions.split(';') {
            if let Some(("ouisig", b64)) = ext.trim().split_once('=').map(|(k, v)| (k.trim(), v)) {
                let raw = B64
                    .decode(b64.trim_matches('"'))
                    .map_err(|_| Error::protocol("bad ouisig encoding"))?;
                signature = Some(
                    <[u8; 64]>::try_from(raw.as_slice())
                        .map_err(|_| Error::protocol("bad ouisig length"))?,
                );
            }
        }
    }
    Ok((size, signature))
}

async fn read_line(
    io: &mut BufReader<Box<dyn AsyncRead + Send + Unpin>>,
) -> Result<String> {
    let mut line = Vec::new();
    loop {
        let byte = io.read_u8().await.map_err(Error::network)?;
        if byte == b'\n' {
            break;
        }
        line.push(byte);
        if line.len() > MAX_HEAD_BYTES {
            return Err(Error::protocol("line too long"));
        }
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line).map_err(|_| Error::protocol("non-utf8 line"))
}

async fn read_until_blank_line(
    io: &mut BufReader<Box<dyn AsyncRead + Send + Unpin>>,
) -> Result<Vec<u8>> {
    let mut raw = Vec::new();
    loop {
        let mut line = Vec::new();
        let n = io.read_until(b'\n', &mut line).await.map_err(Error::network)?;
        if n == 0 {
            return Err(Error::protocol("connection closed inside head"));
        }
        raw.extend_from_slice(&line);
        if raw.len() > MAX_HEAD_BYTES {
            return Err(Error::protocol("head too large"));
        }
        if line == b"\r\n" || line == b"\n" {
            return Ok(raw);
        }
    }
}
