//! End-to-end scenarios from the quarantine data-plane's testable-properties
//! section, driven against real loopback TCP connections with fake replica
//! processes standing in for the application workers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use quarantine_proxy::config::Settings;
use quarantine_proxy::frontend::{self, EngineContext};
use quarantine_proxy::pool::{FakeSupervisor, UpstreamPool};
use quarantine_proxy::reporter::Reporter;
use quarantine_proxy::verdict::VerdictSet;

/// Binds a loopback listener that, for every connection, reads whatever the
/// proxy has forwarded so far (a real application worker parses the request
/// out of its own buffer rather than waiting for the proxy to half-close —
/// the proxy never does, §4.C routes a fully-buffered request in one write),
/// then writes `response` and closes — standing in for an application
/// worker.
async fn spawn_fixed_reply_server(response: &'static [u8]) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let (mut sock, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = sock.read(&mut buf).await;
                let _ = sock.write_all(response).await;
                let _ = sock.shutdown().await;
            });
        }
    });
    port
}

/// Like [`spawn_fixed_reply_server`] but only answers the Nth connection
/// (1-indexed) after `delay`, so a verdict can arrive mid-flight. Earlier
/// connections are held open without a reply until the server is dropped.
async fn spawn_delayed_reply_server(response: &'static [u8], delay: Duration) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let (mut sock, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = sock.read(&mut buf).await;
                tokio::time::sleep(delay).await;
                let _ = sock.write_all(response).await;
                let _ = sock.shutdown().await;
            });
        }
    });
    port
}

struct Harness {
    ctx: Arc<EngineContext>,
    verdicts: Arc<VerdictSet>,
}

impl Harness {
    async fn new(replica_ports: Vec<u16>, sandbox_port: u16) -> Self {
        let settings = Settings {
            replica_ports,
            sandbox: SocketAddr::from(([127, 0, 0, 1], sandbox_port)),
            ..Settings::default()
        };
        let pool = UpstreamPool::new(&settings, Arc::new(FakeSupervisor::new()));
        let verdicts = VerdictSet::new(pool.clone());
        let collector = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let collector_addr = {
            // Reporter needs a UDP endpoint; bind one locally too.
            let udp = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let addr = udp.local_addr().unwrap();
            drop(udp);
            addr
        };
        drop(collector);
        let reporter = Arc::new(Reporter::bind(collector_addr, settings.report_quota).await.unwrap());
        let ctx = Arc::new(EngineContext {
            pool,
            verdicts: verdicts.clone(),
            reporter,
            max_msg: settings.max_msg,
            sandbox: settings.sandbox,
        });
        Harness { ctx, verdicts }
    }

    /// Runs one client request through `frontend::handle_connection` over a
    /// real loopback socket pair and returns the bytes the client received.
    async fn run_request(&self, seq: u64, request: &[u8]) -> Vec<u8> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let ctx = self.ctx.clone();
        let server_task = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            frontend::handle_connection(sock, ctx, seq).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(request).await.unwrap();
        client.shutdown().await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        server_task.await.unwrap();
        response
    }
}

fn request_with_id(id: i64) -> Vec<u8> {
    format!("GET / HTTP/1.0\r\nX-Unique-ID: {id}\r\n\r\n").into_bytes()
}

#[tokio::test]
async fn baseline_trusted_flow_returns_replica_bytes_unchanged() {
    let sandbox_port = spawn_fixed_reply_server(b"SANDBOX REPLY").await;
    let replica_port = spawn_fixed_reply_server(b"HTTP/1.0 200 OK\r\n\r\nhello from replica").await;
    let harness = Harness::new(vec![replica_port], sandbox_port).await;

    let response = harness.run_request(0, &request_with_id(7)).await;
    assert_eq!(response, b"HTTP/1.0 200 OK\r\n\r\nhello from replica");
}

#[tokio::test]
async fn preflagged_id_routes_to_sandbox_without_cycling() {
    let sandbox_port = spawn_fixed_reply_server(b"SANDBOX REPLY").await;
    let replica_port = spawn_fixed_reply_server(b"TRUSTED REPLY").await;
    let harness = Harness::new(vec![replica_port], sandbox_port).await;

    harness.verdicts.receive_verdict(42, 0).await;
    let active_before = harness.ctx.pool.active_index();

    let response = harness.run_request(1, &request_with_id(42)).await;
    assert_eq!(response, b"SANDBOX REPLY");
    // No in-flight trusted transaction existed for 42, so no demotion and no cycle.
    assert_eq!(harness.ctx.pool.active_index(), active_before);
}

#[tokio::test]
async fn mid_flight_verdict_demotes_and_cycles_exactly_once() {
    let sandbox_port = spawn_fixed_reply_server(b"SANDBOX REPLY").await;
    let replica_port = spawn_delayed_reply_server(b"TOO SLOW", Duration::from_secs(2)).await;
    let harness = Harness::new(vec![replica_port, replica_port + 1], sandbox_port).await;

    let ctx = harness.ctx.clone();
    let verdicts = harness.verdicts.clone();
    let request_task = tokio::spawn(async move {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            frontend::handle_connection(sock, ctx, 2).await;
        });
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&request_with_id(99)).await.unwrap();
        client.shutdown().await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        server.await.unwrap();
        response
    });

    // Give the transaction time to reach AwaitingResponse against the trusted replica.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let active_before = harness.ctx.pool.active_index();
    verdicts.receive_verdict(99, 1).await;

    let response = request_task.await.unwrap();
    assert_eq!(response, b"SANDBOX REPLY");
    assert_ne!(harness.ctx.pool.active_index(), active_before);
}

#[tokio::test]
async fn two_rapid_verdicts_coalesce_to_one_cycle() {
    let sandbox_port = spawn_fixed_reply_server(b"SANDBOX REPLY").await;
    let replica_port = spawn_delayed_reply_server(b"TOO SLOW", Duration::from_secs(2)).await;
    let harness = Harness::new(vec![replica_port, replica_port + 1, replica_port + 2], sandbox_port).await;

    let mut tasks = Vec::new();
    for (seq, id) in [(10u64, 10i64), (11, 11)] {
        let ctx = harness.ctx.clone();
        tasks.push(tokio::spawn(async move {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let server = tokio::spawn(async move {
                let (sock, _) = listener.accept().await.unwrap();
                frontend::handle_connection(sock, ctx, seq).await;
            });
            let mut client = TcpStream::connect(addr).await.unwrap();
            client.write_all(&request_with_id(id)).await.unwrap();
            client.shutdown().await.unwrap();
            let mut response = Vec::new();
            client.read_to_end(&mut response).await.unwrap();
            server.await.unwrap();
            response
        }));
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    let active_before = harness.ctx.pool.active_index();

    harness.verdicts.receive_verdict(10, 2).await;
    harness.verdicts.receive_verdict(11, 2).await;

    for task in tasks {
        assert_eq!(task.await.unwrap(), b"SANDBOX REPLY");
    }
    // A single round-robin step forward, not two, despite two verdicts.
    assert_eq!(
        (active_before + 1) % harness.ctx.pool.replica_count(),
        harness.ctx.pool.active_index()
    );
}

#[tokio::test]
async fn parse_failure_drops_connection_without_contacting_upstream() {
    let sandbox_port = spawn_fixed_reply_server(b"SANDBOX REPLY").await;
    let replica_port = spawn_fixed_reply_server(b"TRUSTED REPLY").await;
    let harness = Harness::new(vec![replica_port], sandbox_port).await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let ctx = harness.ctx.clone();
    let server_task = tokio::spawn(async move {
        let (sock, _) = listener.accept().await.unwrap();
        frontend::handle_connection(sock, ctx, 0).await;
    });

    // No CRLF terminator anywhere in 200 KB of filler: MAX_MSG (100_000) is
    // hit before headers_complete() ever sees a trailing CRLF, so the proxy
    // drops the connection partway through — the client may see the write
    // refused with a reset rather than complete cleanly.
    let mut client = TcpStream::connect(addr).await.unwrap();
    let garbage = vec![b'x'; 200_000];
    let _ = client.write_all(&garbage).await;
    let _ = client.shutdown().await;

    let mut response = Vec::new();
    let _ = client.read_to_end(&mut response).await;
    server_task.await.unwrap();

    assert!(response.is_empty(), "dropped connections get no reply bytes");
}

#[tokio::test]
async fn headers_terminator_at_exactly_max_msg_is_accepted() {
    let sandbox_port = spawn_fixed_reply_server(b"SANDBOX REPLY").await;
    let replica_port = spawn_fixed_reply_server(b"HTTP/1.0 200 OK\r\n\r\naccepted").await;
    let harness = Harness::new(vec![replica_port], sandbox_port).await;

    let settings = Settings::default();
    let prefix_len = settings.max_msg - b"X-Unique-ID: 1\r\n\r\n".len();
    let mut request = vec![b'a'; prefix_len];
    request.extend_from_slice(b"X-Unique-ID: 1\r\n\r\n");
    assert_eq!(request.len(), settings.max_msg);

    let response = harness.run_request(0, &request).await;
    assert_eq!(response, b"HTTP/1.0 200 OK\r\n\r\naccepted");
}
