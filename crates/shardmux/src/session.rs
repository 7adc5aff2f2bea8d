//! Client sessions. One task per accepted connection: the read half feeds
//! the request parser, complete requests fan out toward backends, and every
//! request leaves one reply slot in an ordered stream so responses reach the
//! client exactly in request-arrival order no matter how backends interleave.

use crate::backend::Dispatch;
use crate::error::Failure;
use crate::pool::Pool;
use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use futures::stream::{FuturesOrdered, StreamExt};
use proto::{RequestParser, Step};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

type Reply = BoxFuture<'static, Bytes>;

fn ready_reply(bytes: Bytes) -> Reply {
    Box::pin(std::future::ready(bytes))
}

#[tracing::instrument(level = "debug", skip_all, fields(pool = %pool.settings.name))]
pub async fn serve<S>(
    pool: Arc<Pool>,
    socket: S,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pool.stats.client_connections.incr();
    let result = drive(&pool, socket, shutdown).await;
    pool.stats.client_connections.decr();
    result
}

async fn drive<S>(
    pool: &Arc<Pool>,
    socket: S,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let chunk = pool.settings.chunk_size;
    let (mut reader, mut writer) = tokio::io::split(socket);
    let mut rbuf = BytesMut::with_capacity(chunk);
    let mut parser = RequestParser::new(pool.settings.protocol);
    let mut replies: FuturesOrdered<Reply> = FuturesOrdered::new();
    // Set on quit, client FIN, or a request parse error: read no more,
    // flush the replies still owed, then FIN.
    let mut draining = false;

    loop {
        if draining && replies.is_empty() {
            break;
        }

        tokio::select! {
            biased;

            _ = shutdown.cancelled() => return Ok(()),

            Some(reply) = replies.next() => {
                writer.write_all(&reply).await?;
                pool.stats.responses.incr();
                pool.stats.response_bytes.add(reply.len() as u64);
            }

            read = async {
                rbuf.reserve(chunk);
                reader.read_buf(&mut rbuf).await
            }, if !draining => {
                match read {
                    Ok(0) => {
                        pool.stats.client_eof.incr();
                        draining = true;
                    }
                    Ok(_) => loop {
                        match parser.feed(&rbuf) {
                            Step::Incomplete => break,
                            Step::Error(err) => {
                                tracing::debug!(%err, "request parse error, closing client");
                                pool.stats.client_err.incr();
                                draining = true;
                                break;
                            }
                            Step::Complete(len) => {
                                let frame = rbuf.split_to(len).freeze();
                                let req = parser.take(frame);
                                let quit = req.quit;
                                handle_request(pool, req, &mut replies).await;
                                if quit {
                                    draining = true;
                                    break;
                                }
                            }
                        }
                    },
                    Err(err) => {
                        pool.stats.client_err.incr();
                        return Err(err);
                    }
                }
            }
        }
    }

    writer.shutdown().await?;
    Ok(())
}

/// Route one parsed request and append its reply slot. Multi-key requests
/// fan out one sub-request per destination server and coalesce when all
/// fragments are back.
async fn handle_request(pool: &Arc<Pool>, req: proto::Request, replies: &mut FuturesOrdered<Reply>) {
    let protocol = pool.settings.protocol;
    pool.stats.requests.incr();
    pool.stats.request_bytes.add(req.frame.len() as u64);

    if req.quit {
        return;
    }
    if req.noforward {
        if let Some(reply) = proto::local_reply(&req) {
            replies.push_back(ready_reply(reply));
        }
        return;
    }

    let deadline = pool.settings.timeout.map(|t| Instant::now() + t);

    if req.fragmentable() {
        // Resolve every key's destination up front; a dead pool fails the
        // whole request with one synthesized error.
        let mut routes = Vec::with_capacity(req.keys.len());
        for i in 0..req.keys.len() {
            match pool.route(req.key(i)) {
                Ok(idx) => routes.push(idx),
                Err(failure) => {
                    pool.stats.forward_error.incr();
                    replies.push_back(ready_reply(proto::error_reply(protocol, failure.reason())));
                    return;
                }
            }
        }
        let mut routes = routes.into_iter();
        let frags = proto::fragment(&req, |_| routes.next().expect("one route per key"))
            .expect("fragmentable request splits");
        pool.stats.fragments.add(frags.subs.len() as u64);

        let mut receivers = Vec::with_capacity(frags.subs.len());
        for sub in &frags.subs {
            let (tx, rx) = oneshot::channel();
            let conn = pool.connection(sub.server).await;
            if let Err(dispatch) = conn.send(Dispatch {
                frame: sub.frame.clone(),
                reply: Some(tx),
                deadline,
            }) {
                if let Some(reply) = dispatch.reply {
                    let _ = reply.send(Err(Failure::Refused));
                }
            }
            receivers.push(rx);
        }

        replies.push_back(Box::pin(async move {
            let results = futures::future::join_all(receivers).await;
            let mut responses = Vec::with_capacity(results.len());
            for result in results {
                match result {
                    Ok(Ok(rsp)) => responses.push(rsp),
                    Ok(Err(failure)) => return proto::error_reply(protocol, failure.reason()),
                    Err(_) => return proto::error_reply(protocol, Failure::Reset.reason()),
                }
            }
            match proto::coalesce(&req, &frags, &responses) {
                Ok(bytes) => bytes,
                Err(_) => proto::error_reply(protocol, Failure::Invalid.reason()),
            }
        }));
        return;
    }

    let idx = match pool.route(req.first_key()) {
        Ok(idx) => idx,
        Err(failure) => {
            pool.stats.forward_error.incr();
            if !req.noreply {
                replies.push_back(ready_reply(proto::error_reply(protocol, failure.reason())));
            }
            return;
        }
    };

    let conn = pool.connection(idx).await;

    if req.noreply {
        // Fire and forget: no reply slot, no deadline.
        let _ = conn.send(Dispatch {
            frame: req.frame.clone(),
            reply: None,
            deadline: None,
        });
        return;
    }

    let (tx, rx) = oneshot::channel();
    if let Err(dispatch) = conn.send(Dispatch {
        frame: req.frame.clone(),
        reply: Some(tx),
        deadline,
    }) {
        if let Some(reply) = dispatch.reply {
            let _ = reply.send(Err(Failure::Refused));
        }
    }
    replies.push_back(Box::pin(async move {
        match rx.await {
            Ok(Ok(rsp)) => rsp.frame,
            Ok(Err(failure)) => proto::error_reply(protocol, failure.reason()),
            Err(_) => proto::error_reply(protocol, Failure::Reset.reason()),
        }
    }));
}
