//! Peer server
//!
//! Serves locally cached signed responses to other nodes: a TCP listener
//! accepting cache-protocol GETs where the request target is the url key.
//! The response is the stored entry replayed in wire form (chunked body,
//! `;ouisig` extensions, trailers) so the remote side can verify it
//! incrementally. This endpoint is what local discovery advertises and what
//! the DHT announce makes findable.

use std::net::SocketAddr;
use std::sync::Arc;

use cachecraft_core::{Cancel, Error, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, trace};

use crate::head::{field, ResponseHead};
use crate::session::{write_part, Part, Session};
use crate::store::HttpStore;

pub struct PeerServer {
    local_addr: SocketAddr,
}

impl PeerServer {
    /// Bind and start serving; the accept loop stops when `cancel` fires.
    pub async fn start(
        store: Arc<HttpStore>,
        bind: SocketAddr,
        cancel: &Cancel,
    ) -> Result<PeerServer> {
        let listener = TcpListener::bind(bind).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "peer server listening");
        let cancel = cancel.child();
        let accept_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let accepted = match accept_cancel.run(listener.accept()).await {
                    Err(_) => return,
                    Ok(Err(err)) => {
                        debug!(%err, "accept failed");
                        continue;
                    }
                    Ok(Ok(accepted)) => accepted,
                };
                let (stream, remote) = accepted;
                trace!(%remote, "peer connected");
                let store = store.clone();
                let conn_cancel = accept_cancel.child();
                tokio::spawn(async move {
                    if let Err(err) = serve_connection(store, stream, &conn_cancel).await {
                        trace!(%remote, %err, "peer connection ended");
                    }
                });
            }
        });
        Ok(PeerServer { local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

async fn serve_connection(
    store: Arc<HttpStore>,
    stream: TcpStream,
    cancel: &Cancel,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    loop {
        let url = match cancel.run(read_request(&mut reader)).await? {
            Ok(Some(url)) => url,
            Ok(None) => return Ok(()), // clean close between requests
            Err(err) => return Err(err),
        };

        match store.read(&url) {
            Ok(entry) => {
                debug!(%url, "serving cached response");
                let mut session = Session::from_store(entry);
                while let Some(part) = session.next_part(cancel).await? {
                    let part = match part {
                        Part::Head(mut head) => {
                            head.set_header("Transfer-Encoding", "chunked");
                            head.set_header(
                                "Trailer",
                                format!(
                                    "{}, {}, {}",
                                    field::DATA_SIZE,
                                    field::DIGEST,
                                    field::SIG1
                                ),
                            );
                            Part::Head(head)
                        }
                        other => other,
                    };
                    cancel.run(write_part(&mut write_half, &part)).await??;
                }
                cancel.run(write_half.flush()).await??;
            }
            Err(Error::NotFound) => {
                trace!(%url, "request for content we do not hold");
                let mut head = ResponseHead::new(404);
                head.set_header("Content-Length", "0");
                cancel.run(write_half.write_all(&head.to_bytes())).await??;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Parse one request; the request target is the url key verbatim.
/// Returns `Ok(None)` on a clean connection close before a request.
async fn read_request(
    reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
) -> Result<Option<String>> {
    let mut request_line = String::new();
    let n = reader.read_line(&mut request_line).await.map_err(Error::network)?;
    if n == 0 {
        return Ok(None);
    }
    let mut parts = request_line.split_ascii_whitespace();
    let method = parts.next().ok_or_else(|| Error::protocol("empty request line"))?;
    if method != "GET" {
        return Err(Error::protocol(format!("unsupported method {method}")));
    }
    let target = parts
        .next()
        .ok_or_else(|| Error::protocol("request line without target"))?
        .to_string();

    // Drain the request headers; the protocol needs none of them.
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await.map_err(Error::network)?;
        if n == 0 {
            return Err(Error::protocol("connection closed inside request"));
        }
        if line == "\r\n" || line == "\n" {
            break;
        }
    }
    Ok(Some(target))
}
