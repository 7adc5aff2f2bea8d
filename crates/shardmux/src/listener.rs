//! Pool listeners: accept clients and hand each to a session task, bounded
//! by the pool's client cap.

use crate::config::Listen;
use crate::pool::Pool;
use crate::session;
use crate::stats::Stats;
use std::net::ToSocketAddrs;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Bind a TCP listening socket with the pool's configured backlog.
pub fn bind_tcp(addr: &str, backlog: u32) -> std::io::Result<TcpListener> {
    let addr = addr
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty address"))?;

    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        None,
    )?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog as i32)?;
    TcpListener::from_std(socket.into())
}

fn client_permits(cap: usize) -> usize {
    if cap == 0 {
        Semaphore::MAX_PERMITS
    } else {
        cap
    }
}

/// Bind per the pool's `listen` setting and serve until shutdown.
pub async fn listen(
    pool: Arc<Pool>,
    stats: Arc<Stats>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    match pool.settings.listen.clone() {
        Listen::Tcp(addr) => {
            let listener = bind_tcp(&addr, pool.settings.backlog)?;
            tracing::info!(pool = %pool.settings.name, %addr, "listening");
            serve_tcp(listener, pool, stats, shutdown).await
        }
        Listen::Unix(path) => {
            // A stale socket file from a previous run blocks the bind.
            let _ = std::fs::remove_file(&path);
            let listener = UnixListener::bind(&path)?;
            tracing::info!(pool = %pool.settings.name, path = %path.display(), "listening");
            serve_unix(listener, pool, stats, shutdown).await
        }
    }
}

pub async fn serve_tcp(
    listener: TcpListener,
    pool: Arc<Pool>,
    stats: Arc<Stats>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let limit = Arc::new(Semaphore::new(client_permits(
        pool.settings.client_connections,
    )));
    loop {
        tokio::select! {
            accept = listener.accept() => {
                let Ok((socket, addr)) = accept else {
                    continue;
                };
                let _ = socket.set_nodelay(true);
                tracing::debug!(pool = %pool.settings.name, ?addr, "accepted client");
                spawn_session(socket, &pool, &stats, &limit, &shutdown);
            }
            _ = shutdown.cancelled() => return Ok(()),
        }
    }
}

pub async fn serve_unix(
    listener: UnixListener,
    pool: Arc<Pool>,
    stats: Arc<Stats>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let limit = Arc::new(Semaphore::new(client_permits(
        pool.settings.client_connections,
    )));
    loop {
        tokio::select! {
            accept = listener.accept() => {
                let Ok((socket, _)) = accept else {
                    continue;
                };
                spawn_session(socket, &pool, &stats, &limit, &shutdown);
            }
            _ = shutdown.cancelled() => return Ok(()),
        }
    }
}

fn spawn_session<S>(
    socket: S,
    pool: &Arc<Pool>,
    stats: &Arc<Stats>,
    limit: &Arc<Semaphore>,
    shutdown: &CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    // Dropping the socket without a permit is the whole rejection.
    let Ok(permit) = limit.clone().try_acquire_owned() else {
        tracing::warn!(pool = %pool.settings.name, "client limit reached, rejecting");
        return;
    };

    stats.total_connections.incr();
    stats.curr_connections.incr();

    let pool = pool.clone();
    let stats = stats.clone();
    let token = shutdown.child_token();
    tokio::spawn(async move {
        if let Err(err) = session::serve(pool, socket, token).await {
            tracing::debug!(%err, "session ended with error");
        }
        stats.curr_connections.decr();
        drop(permit);
    });
}
