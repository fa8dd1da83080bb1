//! Per-connection protocol state machine.
//!
//! A session moves `AwaitingHello → Active → Closed`. On entry it announces
//! itself (`hello`) and asks for the peer's view (`getpeers`, `getchaintip`,
//! `getmempool`). Input is split on newlines, each line parsed as one JSON
//! message; a line over 100 KiB, malformed JSON, or a pre-handshake message
//! closes the session after an error report. Other protocol errors are
//! reported and the session stays open.
//!
//! Reads and writes are split: outbound messages flow through the peer
//! set's channel into a writer task, so any task in the process can queue
//! to any session. Object intake runs as its own task — validation of a
//! delivered block may need to `getobject` from this very peer, which the
//! read loop must stay free to serve.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use marabu_core::error::ProtocolError;
use marabu_core::message::Message;
use marabu_core::params::{
    AGENT, HELLO_TIMEOUT, IDLE_LINE_TIMEOUT, MAX_MESSAGE_BYTES, PROTOCOL_VERSION,
    version_compatible,
};

use crate::fetcher::ObjectSource;
use crate::node::Node;
use crate::peers::{normalize_peer, Direction};

/// Drive one connection until it closes.
pub async fn run(node: Arc<Node>, stream: TcpStream, addr: String, direction: Direction) {
    let (read_half, mut write_half) = stream.into_split();
    let (session_id, mut outbound, close) = node.peers.register(addr.clone(), direction);

    // Writer task: drains the session's outbound queue. It finishes after
    // the session is unregistered and the queue has flushed.
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let mut line = match serde_json::to_string(&message) {
                Ok(line) => line,
                Err(e) => {
                    warn!("dropping unencodable message: {e}");
                    continue;
                }
            };
            line.push('\n');
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    node.peers.send_to(
        session_id,
        Message::Hello {
            version: PROTOCOL_VERSION.to_string(),
            agent: Some(AGENT.to_string()),
        },
    );
    node.peers.send_to(session_id, Message::GetPeers);
    node.peers.send_to(session_id, Message::GetChaintip);
    node.peers.send_to(session_id, Message::GetMempool);

    match read_loop(&node, session_id, read_half, close).await {
        Ok(()) => info!(peer = %addr, "session closed"),
        Err(err) => {
            node.peers.send_to(session_id, Message::from_error(&err));
            warn!(peer = %addr, "session closed on error: {err}");
        }
    }

    node.peers.unregister(session_id);
    let _ = writer.await;
}

enum ReadFailure {
    TimedOut,
    Io(std::io::Error),
}

async fn read_more(
    reader: &mut OwnedReadHalf,
    buf: &mut BytesMut,
    deadline: Option<Instant>,
) -> Result<usize, ReadFailure> {
    match deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline, reader.read_buf(buf)).await {
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) => Err(ReadFailure::Io(e)),
            Err(_) => Err(ReadFailure::TimedOut),
        },
        None => reader.read_buf(buf).await.map_err(ReadFailure::Io),
    }
}

async fn read_loop(
    node: &Arc<Node>,
    session_id: u64,
    mut reader: OwnedReadHalf,
    close: Arc<Notify>,
) -> Result<(), ProtocolError> {
    let mut buf = BytesMut::with_capacity(8 * 1024);
    let mut awaiting_hello = true;
    let hello_deadline = Instant::now() + HELLO_TIMEOUT;
    let mut partial_deadline: Option<Instant> = None;

    loop {
        let deadline = match (awaiting_hello, partial_deadline) {
            (true, Some(partial)) => Some(hello_deadline.min(partial)),
            (true, None) => Some(hello_deadline),
            (false, partial) => partial,
        };

        let outcome = tokio::select! {
            _ = close.notified() => return Ok(()),
            outcome = read_more(&mut reader, &mut buf, deadline) => outcome,
        };
        let n = match outcome {
            Ok(n) => n,
            Err(ReadFailure::TimedOut) => {
                return Err(ProtocolError::InvalidFormat("timed out".into()));
            }
            Err(ReadFailure::Io(e)) => {
                debug!("socket error: {e}");
                return Ok(());
            }
        };
        if n == 0 {
            return Ok(());
        }

        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line = buf.split_to(pos + 1);
            let line = &line[..pos];
            if line.len() > MAX_MESSAGE_BYTES {
                return Err(ProtocolError::InvalidFormat(
                    "message exceeds 100 KiB".into(),
                ));
            }
            let message: Message = serde_json::from_slice(line).map_err(|e| {
                ProtocolError::InvalidFormat(format!("malformed message: {e}"))
            })?;

            if awaiting_hello {
                match message {
                    Message::Hello { version, agent } => {
                        if !version_compatible(&version) {
                            return Err(ProtocolError::InvalidFormat(format!(
                                "unsupported version {version}"
                            )));
                        }
                        awaiting_hello = false;
                        debug!(agent = agent.as_deref().unwrap_or("?"), "handshake complete");
                    }
                    _ => {
                        return Err(ProtocolError::InvalidHandshake(
                            "received a message before hello".into(),
                        ));
                    }
                }
            } else {
                handle_message(node, session_id, message);
            }
        }

        if buf.len() > MAX_MESSAGE_BYTES {
            return Err(ProtocolError::InvalidFormat(
                "message exceeds 100 KiB".into(),
            ));
        }
        partial_deadline = (!buf.is_empty()).then(|| Instant::now() + IDLE_LINE_TIMEOUT);
    }
}

/// Dispatch one post-handshake message.
fn handle_message(node: &Arc<Node>, session_id: u64, message: Message) {
    match message {
        Message::Hello { .. } => debug!("redundant hello ignored"),
        Message::Error { name, description } => {
            warn!(code = ?name, description = description.as_deref().unwrap_or(""), "peer reported an error");
        }

        Message::GetPeers => {
            node.peers.send_to(
                session_id,
                Message::Peers {
                    peers: node.book.all(),
                },
            );
        }
        Message::Peers { peers } => {
            let mut learned = false;
            for raw in &peers {
                match normalize_peer(raw) {
                    Some(addr) => learned |= node.book.add(&addr),
                    None => debug!(peer = raw.as_str(), "ignoring malformed peer address"),
                }
            }
            if learned {
                node.dial_to_target();
            }
        }

        Message::GetObject { objectid } => match node.store.get_object(&objectid) {
            Ok(Some(object)) => node.peers.send_to(session_id, Message::Object { object }),
            Ok(None) => node.peers.send_to(
                session_id,
                Message::from_error(&ProtocolError::UnknownObject(objectid.to_string())),
            ),
            Err(e) => node
                .peers
                .send_to(session_id, Message::from_error(&ProtocolError::internal(e))),
        },
        Message::IHaveObject { objectid } => match node.store.object_exists(&objectid) {
            Ok(false) => node.peers.send_to(session_id, Message::GetObject { objectid }),
            Ok(true) => {}
            Err(e) => node
                .peers
                .send_to(session_id, Message::from_error(&ProtocolError::internal(e))),
        },
        Message::Object { object } => {
            let node = node.clone();
            tokio::spawn(async move {
                match node.receive_object(object).await {
                    Ok(intake) => {
                        if intake.newly_stored {
                            debug!(object = %intake.id, "object accepted");
                            node.peers
                                .broadcast(&Message::IHaveObject { objectid: intake.id });
                        }
                        if let Some(err) = intake.mempool_rejection {
                            node.peers.send_to(session_id, Message::from_error(&err));
                        }
                    }
                    Err(err) => {
                        node.peers.send_to(session_id, Message::from_error(&err));
                        if err.closes_connection() {
                            node.peers.request_close(session_id);
                        }
                    }
                }
            });
        }

        Message::GetChaintip => match node.chaintip() {
            Ok(Some(tip)) => node
                .peers
                .send_to(session_id, Message::Chaintip { blockid: tip.hash }),
            Ok(None) => {}
            Err(e) => node
                .peers
                .send_to(session_id, Message::from_error(&ProtocolError::internal(e))),
        },
        Message::Chaintip { blockid } => {
            let node = node.clone();
            tokio::spawn(async move {
                if let Err(e) = node.fetcher.ensure(&blockid).await {
                    debug!(block = %blockid, "could not resolve announced chaintip: {e}");
                }
            });
        }

        Message::GetMempool => {
            node.peers.send_to(
                session_id,
                Message::Mempool {
                    txids: node.mempool_txids(),
                },
            );
        }
        Message::Mempool { txids } => {
            for txid in txids {
                let node = node.clone();
                tokio::spawn(async move {
                    if let Err(e) = node.fetcher.ensure(&txid).await {
                        debug!(tx = %txid, "could not resolve mempool transaction: {e}");
                    }
                });
            }
        }
    }
}
