//! Black-box proxy scenarios: real sockets on both sides, scripted backends
//! behind the pool. Routing assertions rely on the modula distribution so
//! key placement is a function of the key alone, not of ephemeral ports.

use bytes::BytesMut;
use proto::{Protocol, Request, RequestParser, Step};
use shardmux::{listener, Pool, Stats};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

type Store = Arc<Mutex<HashMap<Vec<u8>, Vec<u8>>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Healthy,
    /// Accept and read but never reply.
    Silent,
    /// Close every connection as soon as it is accepted.
    CloseOnAccept,
}

#[derive(Clone)]
struct MockBackend {
    addr: SocketAddr,
    mode: Arc<Mutex<Mode>>,
}

impl MockBackend {
    fn set_mode(&self, mode: Mode) {
        *self.mode.lock().unwrap() = mode;
    }

    fn server_line(&self) -> String {
        format!("{}:1", self.addr)
    }
}

async fn spawn_backend(protocol: Protocol, store: Store) -> MockBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mode = Arc::new(Mutex::new(Mode::Healthy));

    let conn_mode = mode.clone();
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(backend_conn(
                socket,
                protocol,
                conn_mode.clone(),
                store.clone(),
            ));
        }
    });

    MockBackend { addr, mode }
}

async fn backend_conn(mut socket: TcpStream, protocol: Protocol, mode: Arc<Mutex<Mode>>, store: Store) {
    if *mode.lock().unwrap() == Mode::CloseOnAccept {
        return;
    }

    let mut buf = BytesMut::new();
    let mut parser = RequestParser::new(protocol);
    loop {
        match socket.read_buf(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        loop {
            match parser.feed(&buf) {
                Step::Incomplete => break,
                Step::Error(_) => return,
                Step::Complete(len) => {
                    let frame = buf.split_to(len).freeze();
                    let req = parser.take(frame);
                    if *mode.lock().unwrap() == Mode::Silent {
                        continue;
                    }
                    let reply = match protocol {
                        Protocol::Memcache => respond_memcache(&req, &store),
                        Protocol::Redis => respond_redis(&req, &store).await,
                    };
                    if !reply.is_empty() && socket.write_all(&reply).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

fn respond_memcache(req: &Request, store: &Store) -> Vec<u8> {
    use proto::MsgType::*;
    match req.msg_type {
        ReqMcGet | ReqMcGets => {
            let mut out = Vec::new();
            let store = store.lock().unwrap();
            for i in 0..req.keys.len() {
                let key = req.key(i);
                if let Some(val) = store.get(key) {
                    out.extend_from_slice(
                        format!("VALUE {} 0 {}\r\n", String::from_utf8_lossy(key), val.len())
                            .as_bytes(),
                    );
                    out.extend_from_slice(val);
                    out.extend_from_slice(b"\r\n");
                }
            }
            out.extend_from_slice(b"END\r\n");
            out
        }
        ReqMcSet | ReqMcAdd | ReqMcReplace => {
            let frame = &req.frame;
            let line_end = frame
                .windows(2)
                .position(|w| w == b"\r\n")
                .expect("storage frame has a command line");
            let val = frame[line_end + 2..frame.len() - 2].to_vec();
            store.lock().unwrap().insert(req.key(0).to_vec(), val);
            if req.noreply {
                Vec::new()
            } else {
                b"STORED\r\n".to_vec()
            }
        }
        ReqMcDelete => {
            let removed = store.lock().unwrap().remove(req.key(0)).is_some();
            match (req.noreply, removed) {
                (true, _) => Vec::new(),
                (false, true) => b"DELETED\r\n".to_vec(),
                (false, false) => b"NOT_FOUND\r\n".to_vec(),
            }
        }
        _ => b"ERROR\r\n".to_vec(),
    }
}

/// Split a RESP request frame into its argument byte strings.
fn resp_args(frame: &[u8]) -> Vec<Vec<u8>> {
    fn line_end(frame: &[u8], from: usize) -> usize {
        from + frame[from..].iter().position(|&b| b == b'\n').unwrap() + 1
    }
    let mut args = Vec::new();
    let mut pos = line_end(frame, 0);
    let n: usize = std::str::from_utf8(&frame[1..pos - 2]).unwrap().parse().unwrap();
    for _ in 0..n {
        let data_start = line_end(frame, pos);
        let len: usize = std::str::from_utf8(&frame[pos + 1..data_start - 2])
            .unwrap()
            .parse()
            .unwrap();
        args.push(frame[data_start..data_start + len].to_vec());
        pos = data_start + len + 2;
    }
    args
}

fn bulk_of(val: Option<&Vec<u8>>) -> Vec<u8> {
    match val {
        Some(v) => {
            let mut out = format!("${}\r\n", v.len()).into_bytes();
            out.extend_from_slice(v);
            out.extend_from_slice(b"\r\n");
            out
        }
        None => b"$-1\r\n".to_vec(),
    }
}

async fn respond_redis(req: &Request, store: &Store) -> Vec<u8> {
    let args = resp_args(&req.frame);
    let cmd = args[0].to_ascii_uppercase();

    // Keys named slow* simulate a lagging shard.
    if args.get(1).is_some_and(|k| k.starts_with(b"slow")) {
        tokio::time::sleep(Duration::from_millis(300)).await;
    }

    match cmd.as_slice() {
        b"SET" => {
            store
                .lock()
                .unwrap()
                .insert(args[1].clone(), args[2].clone());
            b"+OK\r\n".to_vec()
        }
        b"GET" => bulk_of(store.lock().unwrap().get(&args[1])),
        b"MGET" => {
            let store = store.lock().unwrap();
            let mut out = format!("*{}\r\n", args.len() - 1).into_bytes();
            for key in &args[1..] {
                out.extend_from_slice(&bulk_of(store.get(key)));
            }
            out
        }
        b"DEL" => {
            let mut store = store.lock().unwrap();
            let removed = args[1..]
                .iter()
                .filter(|k| store.remove(*k).is_some())
                .count();
            format!(":{removed}\r\n").into_bytes()
        }
        b"MSET" => {
            let mut store = store.lock().unwrap();
            for pair in args[1..].chunks(2) {
                store.insert(pair[0].clone(), pair[1].clone());
            }
            b"+OK\r\n".to_vec()
        }
        b"SELECT" => b"+OK\r\n".to_vec(),
        _ => b"-ERR unknown command\r\n".to_vec(),
    }
}

struct Proxy {
    addr: SocketAddr,
    pool: Arc<Pool>,
    #[allow(dead_code)]
    stats: Arc<Stats>,
    cancel: CancellationToken,
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn spawn_proxy(yaml: &str) -> Proxy {
    let settings = shardmux::load_config(yaml, 16384)
        .unwrap()
        .into_iter()
        .next()
        .unwrap();
    let mut registry = Stats::new();
    let cancel = CancellationToken::new();
    let pool = Pool::new(settings, &mut registry, cancel.child_token());
    let stats = Arc::new(registry);

    let tcp = listener::bind_tcp("127.0.0.1:0", 512).unwrap();
    let addr = tcp.local_addr().unwrap();
    tokio::spawn(listener::serve_tcp(
        tcp,
        pool.clone(),
        stats.clone(),
        cancel.child_token(),
    ));

    Proxy {
        addr,
        pool,
        stats,
        cancel,
    }
}

async fn connect(proxy: &Proxy) -> TcpStream {
    TcpStream::connect(proxy.addr).await.unwrap()
}

/// Read exactly the expected bytes, failing fast rather than hanging.
async fn expect(stream: &mut TcpStream, expected: &[u8]) {
    let mut buf = vec![0u8; expected.len()];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("timed out waiting for response")
        .expect("connection closed early");
    assert_eq!(
        String::from_utf8_lossy(&buf),
        String::from_utf8_lossy(expected)
    );
}

async fn expect_eof(stream: &mut TcpStream) {
    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("timed out waiting for close")
        .expect("read failed");
    assert_eq!(n, 0, "expected FIN, got a byte");
}

fn memcache_pool_yaml(servers: &[&MockBackend], extra: &str) -> String {
    let mut yaml = String::from("test:\n  listen: 127.0.0.1:0\n  distribution: modula\n");
    yaml.push_str(extra);
    yaml.push_str("  servers:\n");
    for backend in servers {
        yaml.push_str(&format!("    - {}\n", backend.server_line()));
    }
    yaml
}

fn redis_pool_yaml(servers: &[&MockBackend], extra: &str) -> String {
    memcache_pool_yaml(servers, &format!("  redis: true\n{extra}"))
}

fn new_store() -> Store {
    Arc::new(Mutex::new(HashMap::new()))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn memcache_set_then_get_round_trips() {
    let store = new_store();
    let backend = spawn_backend(Protocol::Memcache, store).await;
    let proxy = spawn_proxy(&memcache_pool_yaml(&[&backend], "")).await;

    let mut client = connect(&proxy).await;
    client.write_all(b"set x 0 0 1\r\nA\r\n").await.unwrap();
    expect(&mut client, b"STORED\r\n").await;

    client.write_all(b"get x\r\n").await.unwrap();
    expect(&mut client, b"VALUE x 0 1\r\nA\r\nEND\r\n").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn memcache_multi_get_fragments_and_coalesces() {
    // One shared store behind two shards: values come back correct no
    // matter the placement, and the fragment counter proves the split.
    let store = new_store();
    store.lock().unwrap().insert(b"k1".to_vec(), b"a".to_vec());
    store.lock().unwrap().insert(b"k2".to_vec(), b"b".to_vec());
    let b0 = spawn_backend(Protocol::Memcache, store.clone()).await;
    let b1 = spawn_backend(Protocol::Memcache, store).await;
    let proxy = spawn_proxy(&memcache_pool_yaml(&[&b0, &b1], "")).await;

    let mut client = connect(&proxy).await;
    // k1 and k2 land on different modula shards, so this one read becomes
    // two sub-requests, recombined in first-key order.
    client.write_all(b"get k1 k2\r\n").await.unwrap();
    expect(
        &mut client,
        b"VALUE k1 0 1\r\na\r\nVALUE k2 0 1\r\nb\r\nEND\r\n",
    )
    .await;

    assert_eq!(proxy.pool.stats.fragments.get(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn memcache_noreply_is_not_answered() {
    let store = new_store();
    let backend = spawn_backend(Protocol::Memcache, store).await;
    let proxy = spawn_proxy(&memcache_pool_yaml(&[&backend], "")).await;

    let mut client = connect(&proxy).await;
    client
        .write_all(b"set k 0 0 1 noreply\r\nv\r\nget k\r\n")
        .await
        .unwrap();
    // The only bytes back are the get response.
    expect(&mut client, b"VALUE k 0 1\r\nv\r\nEND\r\n").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn memcache_quit_drains_and_closes() {
    let store = new_store();
    let backend = spawn_backend(Protocol::Memcache, store).await;
    let proxy = spawn_proxy(&memcache_pool_yaml(&[&backend], "")).await;

    let mut client = connect(&proxy).await;
    client.write_all(b"set q 0 0 1\r\nZ\r\nquit\r\n").await.unwrap();
    expect(&mut client, b"STORED\r\n").await;
    expect_eof(&mut client).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn memcache_unknown_verb_closes_connection() {
    let store = new_store();
    let backend = spawn_backend(Protocol::Memcache, store).await;
    let proxy = spawn_proxy(&memcache_pool_yaml(&[&backend], "")).await;

    let mut client = connect(&proxy).await;
    client.write_all(b"frobnicate x\r\n").await.unwrap();
    expect_eof(&mut client).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn redis_set_then_get_round_trips() {
    let store = new_store();
    let backend = spawn_backend(Protocol::Redis, store).await;
    let proxy = spawn_proxy(&redis_pool_yaml(&[&backend], "")).await;

    let mut client = connect(&proxy).await;
    client
        .write_all(b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n")
        .await
        .unwrap();
    expect(&mut client, b"+OK\r\n").await;

    client
        .write_all(b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n")
        .await
        .unwrap();
    expect(&mut client, b"$1\r\nv\r\n").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn redis_missing_key_forwards_null_bulk() {
    let store = new_store();
    let backend = spawn_backend(Protocol::Redis, store).await;
    let proxy = spawn_proxy(&redis_pool_yaml(&[&backend], "")).await;

    let mut client = connect(&proxy).await;
    client
        .write_all(b"*2\r\n$3\r\nGET\r\n$4\r\ngone\r\n")
        .await
        .unwrap();
    expect(&mut client, b"$-1\r\n").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn redis_ping_answered_locally() {
    let store = new_store();
    let backend = spawn_backend(Protocol::Redis, store).await;
    // Silence the backend: a forwarded PING would never come back.
    backend.set_mode(Mode::Silent);
    let proxy = spawn_proxy(&redis_pool_yaml(&[&backend], "")).await;

    let mut client = connect(&proxy).await;
    client.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
    expect(&mut client, b"+PONG\r\n").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn redis_mget_returns_original_key_order() {
    let store = new_store();
    {
        let mut s = store.lock().unwrap();
        s.insert(b"a".to_vec(), b"va".to_vec());
        s.insert(b"b".to_vec(), b"vb".to_vec());
        s.insert(b"c".to_vec(), b"vc".to_vec());
    }
    let b0 = spawn_backend(Protocol::Redis, store.clone()).await;
    let b1 = spawn_backend(Protocol::Redis, store).await;
    let proxy = spawn_proxy(&redis_pool_yaml(&[&b0, &b1], "")).await;

    let mut client = connect(&proxy).await;
    // a and c shard apart from b, so the reply is reassembled from two
    // backends yet must read a, b, c.
    client
        .write_all(b"*4\r\n$4\r\nMGET\r\n$1\r\na\r\n$1\r\nb\r\n$1\r\nc\r\n")
        .await
        .unwrap();
    expect(
        &mut client,
        b"*3\r\n$2\r\nva\r\n$2\r\nvb\r\n$2\r\nvc\r\n",
    )
    .await;
    assert_eq!(proxy.pool.stats.fragments.get(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn redis_mset_fans_out_and_replies_once() {
    let store = new_store();
    let b0 = spawn_backend(Protocol::Redis, store.clone()).await;
    let b1 = spawn_backend(Protocol::Redis, store).await;
    let proxy = spawn_proxy(&redis_pool_yaml(&[&b0, &b1], "")).await;

    let mut client = connect(&proxy).await;
    client
        .write_all(b"*5\r\n$4\r\nMSET\r\n$2\r\nk1\r\n$2\r\nv1\r\n$2\r\nk2\r\n$2\r\nv2\r\n")
        .await
        .unwrap();
    expect(&mut client, b"+OK\r\n").await;
    assert_eq!(proxy.pool.stats.fragments.get(), 2);

    client
        .write_all(b"*2\r\n$3\r\nGET\r\n$2\r\nk1\r\n")
        .await
        .unwrap();
    expect(&mut client, b"$2\r\nv1\r\n").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn redis_del_sums_fragment_counts() {
    let store = new_store();
    {
        let mut s = store.lock().unwrap();
        s.insert(b"k1".to_vec(), b"x".to_vec());
        s.insert(b"k2".to_vec(), b"y".to_vec());
    }
    let b0 = spawn_backend(Protocol::Redis, store.clone()).await;
    let b1 = spawn_backend(Protocol::Redis, store).await;
    let proxy = spawn_proxy(&redis_pool_yaml(&[&b0, &b1], "")).await;

    let mut client = connect(&proxy).await;
    client
        .write_all(b"*3\r\n$3\r\nDEL\r\n$2\r\nk1\r\n$2\r\nk2\r\n")
        .await
        .unwrap();
    expect(&mut client, b":2\r\n").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn responses_keep_request_order_across_shards() {
    let store = new_store();
    {
        let mut s = store.lock().unwrap();
        s.insert(b"slow".to_vec(), b"S".to_vec());
        s.insert(b"fast".to_vec(), b"F".to_vec());
    }
    let b0 = spawn_backend(Protocol::Redis, store.clone()).await;
    let b1 = spawn_backend(Protocol::Redis, store).await;
    let proxy = spawn_proxy(&redis_pool_yaml(&[&b0, &b1], "")).await;

    let mut client = connect(&proxy).await;
    // The slow shard answers ~300ms after the fast one, yet the slow
    // response must be delivered first.
    client
        .write_all(b"*2\r\n$3\r\nGET\r\n$4\r\nslow\r\n*2\r\n$3\r\nGET\r\n$4\r\nfast\r\n")
        .await
        .unwrap();
    expect(&mut client, b"$1\r\nS\r\n$1\r\nF\r\n").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn silent_backend_times_out_with_error_reply() {
    let store = new_store();
    let backend = spawn_backend(Protocol::Redis, store).await;
    backend.set_mode(Mode::Silent);
    let proxy = spawn_proxy(&redis_pool_yaml(&[&backend], "  timeout: 100\n")).await;

    let mut client = connect(&proxy).await;
    let started = std::time::Instant::now();
    client
        .write_all(b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n")
        .await
        .unwrap();
    expect(&mut client, b"-ERR Connection timed out\r\n").await;
    assert!(started.elapsed() >= Duration::from_millis(90));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_backend_is_ejected_then_retried() {
    let store = new_store();
    store.lock().unwrap().insert(b"k1".to_vec(), b"v1".to_vec());
    let healthy = spawn_backend(Protocol::Redis, store.clone()).await;
    let flaky = spawn_backend(Protocol::Redis, store).await;
    flaky.set_mode(Mode::CloseOnAccept);

    // k1 routes to the second server (the flaky one) under modula.
    let proxy = spawn_proxy(&redis_pool_yaml(
        &[&healthy, &flaky],
        "  auto_eject_hosts: true\n  server_failure_limit: 2\n  server_retry_timeout: 400\n",
    ))
    .await;

    let mut client = connect(&proxy).await;
    for _ in 0..2 {
        client
            .write_all(b"*2\r\n$3\r\nGET\r\n$2\r\nk1\r\n")
            .await
            .unwrap();
        expect(&mut client, b"-ERR Connection reset by peer\r\n").await;
    }
    assert_eq!(proxy.pool.live_servers(), 1);
    assert_eq!(proxy.pool.stats.server_ejects.get(), 1);

    // While ejected, the same key is served by the surviving shard.
    client
        .write_all(b"*2\r\n$3\r\nGET\r\n$2\r\nk1\r\n")
        .await
        .unwrap();
    expect(&mut client, b"$2\r\nv1\r\n").await;

    // After the retry window the recovered server rejoins the continuum.
    flaky.set_mode(Mode::Healthy);
    tokio::time::sleep(Duration::from_millis(500)).await;
    client
        .write_all(b"*2\r\n$3\r\nGET\r\n$2\r\nk1\r\n")
        .await
        .unwrap();
    expect(&mut client, b"$2\r\nv1\r\n").await;
    assert_eq!(proxy.pool.live_servers(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stats_endpoint_dumps_json_per_connect() {
    let store = new_store();
    let backend = spawn_backend(Protocol::Memcache, store).await;

    let settings = shardmux::load_config(&memcache_pool_yaml(&[&backend], ""), 16384)
        .unwrap()
        .into_iter()
        .next()
        .unwrap();
    let mut registry = Stats::new();
    let cancel = CancellationToken::new();
    let pool = Pool::new(settings, &mut registry, cancel.child_token());
    let stats = Arc::new(registry);

    let tcp = listener::bind_tcp("127.0.0.1:0", 512).unwrap();
    let proxy_addr = tcp.local_addr().unwrap();
    tokio::spawn(listener::serve_tcp(
        tcp,
        pool,
        stats.clone(),
        cancel.child_token(),
    ));

    let stats_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let stats_addr = stats_listener.local_addr().unwrap();
    tokio::spawn(shardmux::stats::serve(
        stats_listener,
        stats,
        cancel.child_token(),
    ));

    // Push one request through so the counters move.
    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client.write_all(b"set s 0 0 1\r\nQ\r\n").await.unwrap();
    expect(&mut client, b"STORED\r\n").await;

    let mut stats_client = TcpStream::connect(stats_addr).await.unwrap();
    let mut body = Vec::new();
    tokio::time::timeout(
        Duration::from_secs(5),
        stats_client.read_to_end(&mut body),
    )
    .await
    .expect("timed out reading stats")
    .unwrap();

    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["service"], "shardmux");
    assert_eq!(json["total_connections"], 1);
    assert_eq!(json["test"]["requests"], 1);
    assert!(json["test"].get(backend.addr.to_string().as_str()).is_some());

    cancel.cancel();
}
