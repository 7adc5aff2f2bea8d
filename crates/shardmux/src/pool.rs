//! Server pools: key routing through the continuum, auto-ejection with
//! timed retry, and per-server connection reuse.

use crate::backend::{self, BackendHandle};
use crate::config::{PoolSettings, ServerConf};
use crate::error::Failure;
use crate::stats::{PoolStats, ServerStats, Stats};
use hashkit::{hash_key, Continuum, Seed};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

pub struct Server {
    pub conf: ServerConf,
    pub stats: Arc<ServerStats>,
    conns: tokio::sync::Mutex<VecDeque<BackendHandle>>,
}

#[derive(Debug)]
struct FailState {
    failure_count: u32,
    next_retry: Option<Instant>,
}

#[derive(Debug)]
struct PoolState {
    continuum: Continuum,
    nlive: usize,
    /// Earliest `next_retry` among ejected servers; rebuild is due once it
    /// passes.
    next_rebuild: Option<Instant>,
    fails: Vec<FailState>,
}

pub struct Pool {
    pub settings: PoolSettings,
    pub stats: Arc<PoolStats>,
    pub servers: Vec<Arc<Server>>,
    pub shutdown: CancellationToken,
    state: Mutex<PoolState>,
}

impl Pool {
    pub fn new(
        settings: PoolSettings,
        registry: &mut Stats,
        shutdown: CancellationToken,
    ) -> Arc<Pool> {
        let (pool_stats, server_stats) = registry.register_pool(
            &settings.name,
            settings.servers.iter().map(|s| s.name.clone()),
        );

        let servers: Vec<Arc<Server>> = settings
            .servers
            .iter()
            .zip(server_stats)
            .map(|(conf, stats)| {
                Arc::new(Server {
                    conf: conf.clone(),
                    stats,
                    conns: tokio::sync::Mutex::new(VecDeque::new()),
                })
            })
            .collect();

        let fails = settings
            .servers
            .iter()
            .map(|_| FailState {
                failure_count: 0,
                next_retry: None,
            })
            .collect();

        let pool = Arc::new(Pool {
            stats: pool_stats,
            servers,
            shutdown,
            state: Mutex::new(PoolState {
                continuum: Continuum::build(settings.distribution, &[]),
                nlive: 0,
                next_rebuild: None,
                fails,
            }),
            settings,
        });

        let mut st = pool.state.lock().unwrap();
        pool.rebuild_locked(&mut st, Instant::now());
        drop(st);

        pool
    }

    /// The routing key: the bytes between the hash tag pair when one is
    /// configured and present, the full key otherwise.
    pub fn routing_key<'a>(&self, key: &'a [u8]) -> &'a [u8] {
        let Some((open, close)) = self.settings.hash_tag else {
            return key;
        };
        let Some(start) = key.iter().position(|&b| b == open) else {
            return key;
        };
        let rest = &key[start + 1..];
        match rest.iter().position(|&b| b == close) {
            Some(end) if end > 0 => &rest[..end],
            _ => key,
        }
    }

    /// Map a key to a live server index.
    pub fn route(&self, key: &[u8]) -> Result<usize, Failure> {
        let now = Instant::now();
        let mut st = self.state.lock().unwrap();

        // Fold ejected servers back in once their retry time passes.
        if self.settings.auto_eject_hosts {
            if let Some(next) = st.next_rebuild {
                if now > next {
                    self.rebuild_locked(&mut st, now);
                } else if st.nlive == 0 {
                    return Err(Failure::Refused);
                }
            }
        }
        if st.nlive == 0 {
            return Err(Failure::Refused);
        }

        if self.servers.len() == 1 {
            return Ok(0);
        }
        let rkey = self.routing_key(key);
        if rkey.is_empty() {
            return Ok(0);
        }

        let hash = hash_key(self.settings.hash, rkey);
        st.continuum
            .dispatch(hash)
            .map(|i| i as usize)
            .ok_or(Failure::Refused)
    }

    fn rebuild_locked(&self, st: &mut PoolState, now: Instant) {
        st.next_rebuild = None;
        let mut seeds = Vec::with_capacity(self.servers.len());

        for (i, server) in self.servers.iter().enumerate() {
            let live = if self.settings.auto_eject_hosts {
                match st.fails[i].next_retry {
                    Some(retry) if retry > now => {
                        st.next_rebuild = Some(match st.next_rebuild {
                            Some(cur) => cur.min(retry),
                            None => retry,
                        });
                        false
                    }
                    _ => {
                        st.fails[i].next_retry = None;
                        true
                    }
                }
            } else {
                true
            };
            if live {
                seeds.push(Seed {
                    index: i as u32,
                    name: server.conf.name.clone(),
                    weight: server.conf.weight,
                });
            }
        }

        st.nlive = seeds.len();
        st.continuum = Continuum::build(self.settings.distribution, &seeds);
        tracing::debug!(
            pool = %self.settings.name,
            nlive = st.nlive,
            nserver = self.servers.len(),
            points = st.continuum.len(),
            "rebuilt continuum"
        );
    }

    /// Record a failed exchange with a server. Transient conditions bump the
    /// counter but never eject.
    pub fn note_failure(&self, idx: usize, transient: bool) {
        if !self.settings.auto_eject_hosts {
            return;
        }
        let now = Instant::now();
        let mut st = self.state.lock().unwrap();
        let fail = &mut st.fails[idx];
        fail.failure_count += 1;
        tracing::debug!(
            server = %self.servers[idx].conf.name,
            failures = fail.failure_count,
            limit = self.settings.server_failure_limit,
            "server failure"
        );
        if transient || fail.failure_count < self.settings.server_failure_limit {
            return;
        }

        fail.failure_count = 0;
        fail.next_retry = Some(now + self.settings.server_retry_timeout);
        self.stats.server_ejects.incr();
        tracing::warn!(
            pool = %self.settings.name,
            server = %self.servers[idx].conf.name,
            retry_in = ?self.settings.server_retry_timeout,
            "ejecting server"
        );
        self.rebuild_locked(&mut st, now);
    }

    /// A server answered: clear its failure history.
    pub fn note_success(&self, idx: usize) {
        if !self.settings.auto_eject_hosts {
            return;
        }
        let mut st = self.state.lock().unwrap();
        let fail = &mut st.fails[idx];
        if fail.failure_count != 0 || fail.next_retry.is_some() {
            fail.failure_count = 0;
            fail.next_retry = None;
        }
    }

    /// Borrow a connection to the given server: below the per-server cap a
    /// fresh one is opened, at the cap they round-robin.
    pub async fn connection(self: &Arc<Pool>, idx: usize) -> BackendHandle {
        let server = &self.servers[idx];
        let mut conns = server.conns.lock().await;
        conns.retain(|h| !h.is_closed());

        if conns.len() < self.settings.server_connections {
            let handle = backend::spawn(self.clone(), idx);
            conns.push_back(handle.clone());
            return handle;
        }
        let handle = conns.pop_front().expect("cap is at least one");
        conns.push_back(handle.clone());
        handle
    }

    /// Eagerly open the full connection complement to every server.
    pub async fn preconnect(self: &Arc<Pool>) {
        for idx in 0..self.servers.len() {
            let server = &self.servers[idx];
            let mut conns = server.conns.lock().await;
            while conns.len() < self.settings.server_connections {
                conns.push_back(backend::spawn(self.clone(), idx));
            }
        }
    }

    /// Servers currently on the continuum.
    pub fn live_servers(&self) -> usize {
        self.state.lock().unwrap().nlive
    }
}
