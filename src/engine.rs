use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::config::Settings;
use crate::error::Result;
use crate::frontend::{self, EngineContext};
use crate::pool::{ProcessSupervisor, UpstreamPool};
use crate::reporter::Reporter;
use crate::transport::Listener;
use crate::verdict::{parse_verdict_id, VerdictSet};

/// Cap on a verdict message: an ASCII id plus filler (§6).
const VERDICT_READ_CAP: usize = 32;

/// Brings up every listener and shared collaborator (module G). Each
/// listener runs as its own task driving an unbounded accept loop; every
/// accepted connection gets its own spawned task. This is the Tokio
/// equivalent of the reference single-threaded ready-set loop: §5
/// explicitly allows substituting an OS readiness primitive as long as
/// ordering guarantees are preserved, and per-connection tasks preserve
/// them because each transaction's own stage transitions are still strictly
/// sequential (§4.C) and the FIFO fairness promised by §4.G falls out of
/// the OS scheduler fairly servicing runnable tasks.
pub async fn run(settings: Settings) -> Result<()> {
    crate::clock::start();

    let supervisor = Arc::new(ProcessSupervisor::new(
        settings.replica_exe.clone(),
        settings.replica_args.clone(),
    ));
    let pool = UpstreamPool::new(&settings, supervisor);
    pool.spawn_all().await?;

    let verdicts = VerdictSet::new(pool.clone());
    let reporter = Arc::new(Reporter::bind(settings.collector, settings.report_quota).await?);

    let ctx = Arc::new(EngineContext {
        pool: pool.clone(),
        verdicts: verdicts.clone(),
        reporter,
        max_msg: settings.max_msg,
        sandbox: settings.sandbox,
    });

    let sequence = Arc::new(AtomicU64::new(0));

    let frontend_listener = Listener::bind(format!("0.0.0.0:{}", settings.frontend_port)).await?;
    let verdict_listener = Listener::bind(format!("0.0.0.0:{}", settings.verdict_port)).await?;

    info!(
        frontend_port = settings.frontend_port,
        verdict_port = settings.verdict_port,
        replicas = pool.replica_count(),
        "quarantine proxy started"
    );

    let frontend_task = tokio::spawn(run_frontend_listener(frontend_listener, ctx, sequence.clone()));
    let verdict_task = tokio::spawn(run_verdict_listener(verdict_listener, verdicts, sequence));

    let (frontend_result, verdict_result) = tokio::join!(frontend_task, verdict_task);
    frontend_result.expect("frontend listener task panicked")?;
    verdict_result.expect("verdict listener task panicked")?;
    Ok(())
}

async fn run_frontend_listener(
    listener: Listener,
    ctx: Arc<EngineContext>,
    sequence: Arc<AtomicU64>,
) -> Result<()> {
    loop {
        let stream = listener.accept().await?;
        let seq = sequence.fetch_add(1, Ordering::Relaxed);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            frontend::handle_connection(stream, ctx, seq).await;
        });
    }
}

async fn run_verdict_listener(
    listener: Listener,
    verdicts: Arc<VerdictSet>,
    sequence: Arc<AtomicU64>,
) -> Result<()> {
    loop {
        let stream = listener.accept().await?;
        let verdicts = verdicts.clone();
        let sequence = sequence.clone();
        tokio::spawn(async move {
            handle_verdict_connection(stream, verdicts, sequence).await;
        });
    }
}

async fn handle_verdict_connection(mut stream: TcpStream, verdicts: Arc<VerdictSet>, sequence: Arc<AtomicU64>) {
    let mut buf = [0u8; VERDICT_READ_CAP];
    let n = match stream.read(&mut buf).await {
        Ok(n) if n > 0 => n,
        _ => return,
    };
    match parse_verdict_id(&buf[..n]) {
        Ok(id) => {
            let seq = sequence.load(Ordering::Relaxed);
            verdicts.receive_verdict(id, seq).await;
        }
        Err(e) => warn!(error = %e, "malformed verdict message, ignoring"),
    }
}
