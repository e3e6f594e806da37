use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, instrument, warn};

use crate::clock::now_us;
use crate::error::Result;
use crate::reporter::{Report, ReportKind, Reporter};
use crate::txn::{Stage, Transaction, UpstreamKind};
use crate::verdict::{TxnHandle, VerdictSet};
use crate::pool::UpstreamPool;

const READ_CHUNK: usize = 16 * 1024;

/// Everything a connection-handling task needs, shared across every
/// transaction (module C's collaborators: D, E, F).
pub struct EngineContext {
    pub pool: Arc<UpstreamPool>,
    pub verdicts: Arc<VerdictSet>,
    pub reporter: Arc<Reporter>,
    pub max_msg: usize,
    pub sandbox: SocketAddr,
}

/// Drops the transaction's registry entry unconditionally, whether the
/// connection completes normally or is abandoned on error (§4.E: entries
/// are retained only until the owning transaction reaches Done).
struct TxnGuard {
    handle: Arc<TxnHandle>,
    verdicts: Arc<VerdictSet>,
}

impl Drop for TxnGuard {
    fn drop(&mut self) {
        self.verdicts.complete(&self.handle);
    }
}

/// Drives one accepted client connection through the full stage machine
/// (§4.C). Spawned once per accepted connection; owns its `Transaction`
/// exclusively for its whole lifetime.
#[instrument(skip(stream, ctx, enqueue_seq), fields(seq = enqueue_seq))]
pub async fn handle_connection(mut stream: TcpStream, ctx: Arc<EngineContext>, enqueue_seq: u64) {
    let mut txn = Transaction::new(enqueue_seq);
    txn.stage = Stage::ReadingRequest;

    if read_request(&mut stream, &mut txn, ctx.max_msg).await.is_err() {
        debug!(seq = enqueue_seq, "dropping connection: parse failure");
        return;
    }

    txn.id = txn.parse_id().unwrap_or(-1);
    txn.t_request_done = now_us();

    let handle = TxnHandle::new(txn.id, enqueue_seq);
    ctx.verdicts.register(handle.clone());
    let _guard = TxnGuard {
        handle: handle.clone(),
        verdicts: ctx.verdicts.clone(),
    };

    txn.stage = Stage::Routing;
    let mut kind = route(&ctx, txn.id);

    loop {
        let upstream_addr = endpoint_for(&ctx, kind);
        let mut upstream = match connect_with_retry(upstream_addr).await {
            Some(s) => s,
            None => return,
        };

        if kind.is_sandbox() {
            handle.clear_awaiting_trusted();
        } else {
            handle.mark_awaiting_trusted();
        }

        if upstream.write_all(&txn.req_buf).await.is_err() {
            warn!(id = txn.id, "failed to write request upstream");
            return;
        }
        txn.t_upstream_write_done = now_us();
        txn.stage = Stage::AwaitingResponse;
        txn.upstream_kind = Some(kind);

        let demoted = tokio::select! {
            result = read_response(&mut upstream, &mut txn) => {
                if result.is_err() {
                    warn!(id = txn.id, "failed reading upstream response");
                    return;
                }
                // The trusted replica answered before any verdict arrived:
                // clear the demotable flag now, while still in
                // AwaitingResponse, so a verdict landing during the
                // WritingResponse write-back below finds nothing to demote
                // and does not trigger a spurious cycle (§4.E only cycles
                // for transactions actually demoted out of AwaitingResponse).
                handle.clear_awaiting_trusted();
                false
            }
            _ = handle.wait_for_demotion(), if !kind.is_sandbox() => true,
        };

        if demoted {
            info!(id = txn.id, "demoting in-flight transaction to sandbox");
            drop(upstream);
            // req_buf is untouched so the request can be replayed verbatim
            // against the sandbox (§3: "req_buf is preserved").
            txn.stage = Stage::Routing;
            kind = UpstreamKind::Sandbox;
            continue;
        }

        break;
    }

    txn.t_response_done = now_us();
    txn.stage = Stage::WritingResponse;

    if stream.write_all(&txn.res_buf).await.is_err() {
        warn!(id = txn.id, "failed to write response to client");
        return;
    }
    txn.t_reply_done = now_us();
    txn.stage = Stage::Done;

    if let Some(meta) = ctx.verdicts.complete(&handle) {
        info!(
            id = txn.id,
            t_accept = txn.t_accept,
            t_request_done = txn.t_request_done,
            t_upstream_write_done = txn.t_upstream_write_done,
            t_response_done = txn.t_response_done,
            t_reply_done = txn.t_reply_done,
            verdict_arrived_us = meta.arrived_us,
            verdict_sequence = meta.sequence,
            verdict_completed_us = meta.completed_us,
            "transaction flagged malicious completed"
        );
    }

    let latency = txn.t_response_done - txn.t_upstream_write_done;
    ctx.reporter
        .report_pair(
            kind,
            latency,
            Report {
                kind: ReportKind::Request,
                id: txn.id,
                timestamp_us: txn.t_request_done,
                buffer: txn.req_buf.clone(),
            },
            Report {
                kind: ReportKind::Response,
                id: txn.id,
                timestamp_us: txn.t_response_done,
                buffer: txn.res_buf.clone(),
            },
        )
        .await;
}

async fn read_request(stream: &mut TcpStream, txn: &mut Transaction, max_msg: usize) -> Result<()> {
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(crate::error::Error::parse_failure());
        }
        txn.append_request(&chunk[..n], max_msg)?;
        if txn.headers_complete() {
            return Ok(());
        }
    }
}

async fn read_response(stream: &mut TcpStream, txn: &mut Transaction) -> Result<()> {
    txn.res_buf.clear();
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        txn.res_buf.extend_from_slice(&chunk[..n]);
    }
}

fn route(ctx: &EngineContext, id: i64) -> UpstreamKind {
    if ctx.verdicts.is_malicious(id) {
        UpstreamKind::Sandbox
    } else {
        UpstreamKind::Trusted(ctx.pool.active_index())
    }
}

fn endpoint_for(ctx: &EngineContext, kind: UpstreamKind) -> SocketAddr {
    match kind {
        UpstreamKind::Sandbox => ctx.sandbox,
        // The replica index was fixed at the moment of the Routing
        // decision (§4.C: "a mid-flight verdict ... does not retroactively
        // affect that routing decision unless a demotion is issued"), so
        // this looks up the port for that specific index, not whatever is
        // active now.
        UpstreamKind::Trusted(index) => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), ctx.pool.port_at(index))
        }
    }
}

/// Connects to `addr`, retrying indefinitely on refusal (§4.C edge cases:
/// "the reference behavior is indefinite retry ... bounded only by client
/// disconnect"). Returns `None` only if the retry loop is abandoned because
/// the whole task is being dropped, which in practice never happens here
/// since this future isn't raced against anything — kept as a `Result`-like
/// `Option` so a future cap can short-circuit it without changing callers.
async fn connect_with_retry(addr: SocketAddr) -> Option<TcpStream> {
    loop {
        match TcpStream::connect(addr).await {
            Ok(s) => return Some(s),
            Err(e) => {
                debug!(%addr, error = %e, "upstream connect failed, retrying");
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            }
        }
    }
}
