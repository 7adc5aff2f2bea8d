//! Backend connections. Each connection is one task owning the socket: it
//! drains a dispatch channel into pipelined writes, pairs responses with the
//! in-flight FIFO, and enforces the pool's per-request deadline by closing
//! the whole connection when the head request expires. Any close
//! error-completes everything queued or in flight.

use crate::error::Failure;
use crate::pool::Pool;
use bytes::{BufMut, Bytes, BytesMut};
use proto::{Response, ResponseParser, Step};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// One request handed to a backend connection. `reply` is `None` for
/// `noreply` requests, which never enter the in-flight queue. A dropped
/// receiver swallows the response silently.
#[derive(Debug)]
pub struct Dispatch {
    pub frame: Bytes,
    pub reply: Option<oneshot::Sender<Result<Response, Failure>>>,
    pub deadline: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct BackendHandle {
    tx: mpsc::UnboundedSender<Dispatch>,
}

impl BackendHandle {
    /// Enqueue toward the backend; the error returns the dispatch when the
    /// connection task is already gone.
    pub fn send(&self, dispatch: Dispatch) -> Result<(), Dispatch> {
        self.tx.send(dispatch).map_err(|e| e.0)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

struct Inflight {
    reply: Option<oneshot::Sender<Result<Response, Failure>>>,
    deadline: Option<Instant>,
}

/// Spawn a connection task toward server `idx` of `pool`. Requests may be
/// enqueued immediately; they are written once the connect completes.
pub fn spawn(pool: Arc<Pool>, idx: usize) -> BackendHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run(pool, idx, rx));
    BackendHandle { tx }
}

#[tracing::instrument(level = "debug", skip(pool, rx), fields(pool = %pool.settings.name))]
async fn run(pool: Arc<Pool>, idx: usize, mut rx: mpsc::UnboundedReceiver<Dispatch>) {
    let server = pool.servers[idx].clone();
    let addr = server.conf.addr.clone();

    let connect = TcpStream::connect(&addr);
    let connected = match pool.settings.timeout {
        Some(t) => match tokio::time::timeout(t, connect).await {
            Ok(r) => r,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "connect timed out",
            )),
        },
        None => connect.await,
    };

    let stream = match connected {
        Ok(stream) => stream,
        Err(err) => {
            tracing::warn!(server = %addr, %err, "connect failed");
            server.stats.server_err.incr();
            pool.note_failure(idx, false);
            fail_queued(&mut rx, Failure::Refused);
            return;
        }
    };
    let _ = stream.set_nodelay(true);
    tracing::debug!(server = %addr, "connected");
    server.stats.server_connections.incr();

    let (mut reader, mut writer) = stream.into_split();
    let mut rbuf = BytesMut::with_capacity(pool.settings.chunk_size);
    let mut parser = ResponseParser::new(pool.settings.protocol);
    let mut inflight: VecDeque<Inflight> = VecDeque::new();
    let mut rx_open = true;
    let shutdown = pool.shutdown.clone();

    // A fresh connection to a non-default db selects it before anything
    // else; the reply is discarded through a replyless in-flight slot.
    if let Some(db) = pool.settings.redis_db {
        let db = db.to_string();
        let frame = format!("*2\r\n$6\r\nSELECT\r\n${}\r\n{}\r\n", db.len(), db);
        if writer.write_all(frame.as_bytes()).await.is_err() {
            server.stats.server_err.incr();
            server.stats.server_connections.decr();
            pool.note_failure(idx, false);
            fail_queued(&mut rx, Failure::Reset);
            return;
        }
        inflight.push_back(Inflight {
            reply: None,
            deadline: pool.settings.timeout.map(|t| Instant::now() + t),
        });
    }

    let reason: Option<Failure> = 'conn: loop {
        if !rx_open && inflight.is_empty() {
            break 'conn None;
        }
        let deadline = inflight.front().and_then(|i| i.deadline);

        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                break 'conn Some(Failure::Reset);
            }

            dispatch = rx.recv(), if rx_open => {
                let Some(first) = dispatch else {
                    rx_open = false;
                    continue;
                };
                // Batch every request already queued into one write.
                let mut out = BytesMut::with_capacity(first.frame.len());
                let mut batch = vec![first];
                while let Ok(more) = rx.try_recv() {
                    batch.push(more);
                }
                for dispatch in batch {
                    out.put_slice(&dispatch.frame);
                    server.stats.requests.incr();
                    server.stats.request_bytes.add(dispatch.frame.len() as u64);
                    if let Some(reply) = dispatch.reply {
                        inflight.push_back(Inflight {
                            reply: Some(reply),
                            deadline: dispatch.deadline,
                        });
                    }
                }
                if let Err(err) = writer.write_all(&out).await {
                    tracing::warn!(server = %addr, %err, "write failed");
                    break 'conn Some(Failure::Reset);
                }
            }

            read = async {
                rbuf.reserve(pool.settings.chunk_size);
                reader.read_buf(&mut rbuf).await
            } => {
                match read {
                    Ok(0) => {
                        // Server FIN closes the connection immediately,
                        // outstanding or not.
                        server.stats.server_eof.incr();
                        break 'conn if inflight.is_empty() && !rx_open {
                            None
                        } else {
                            Some(Failure::Eof)
                        };
                    }
                    Ok(_) => loop {
                        match parser.feed(&rbuf) {
                            Step::Incomplete => break,
                            Step::Error(err) => {
                                tracing::warn!(server = %addr, %err, "response parse error");
                                break 'conn Some(Failure::Invalid);
                            }
                            Step::Complete(len) => {
                                let frame = rbuf.split_to(len).freeze();
                                let rsp = parser.take(frame);
                                server.stats.responses.incr();
                                server.stats.response_bytes.add(len as u64);

                                let Some(entry) = inflight.pop_front() else {
                                    tracing::warn!(server = %addr, "unsolicited response");
                                    break 'conn Some(Failure::Invalid);
                                };
                                if rsp.is_transient_failure() {
                                    pool.note_failure(idx, true);
                                } else {
                                    pool.note_success(idx);
                                }
                                if let Some(reply) = entry.reply {
                                    let _ = reply.send(Ok(rsp));
                                }
                            }
                        }
                    },
                    Err(err) => {
                        tracing::warn!(server = %addr, %err, "read failed");
                        break 'conn Some(Failure::Reset);
                    }
                }
            }

            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                tracing::warn!(server = %addr, "request deadline expired, closing connection");
                break 'conn Some(Failure::Timeout);
            }
        }
    };

    server.stats.server_connections.decr();

    if let Some(reason) = reason {
        match reason {
            Failure::Timeout => server.stats.server_timedout.incr(),
            Failure::Eof => {}
            _ => server.stats.server_err.incr(),
        }
        // Reactor shutdown is not a backend fault.
        if !shutdown.is_cancelled() {
            pool.note_failure(idx, false);
        }
        for entry in inflight {
            if let Some(reply) = entry.reply {
                let _ = reply.send(Err(reason));
            }
        }
        fail_queued(&mut rx, reason);
    }
}

/// Error-complete everything still sitting in the dispatch channel.
fn fail_queued(rx: &mut mpsc::UnboundedReceiver<Dispatch>, reason: Failure) {
    rx.close();
    while let Ok(dispatch) = rx.try_recv() {
        if let Some(reply) = dispatch.reply {
            let _ = reply.send(Err(reason));
        }
    }
}
