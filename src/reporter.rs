use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{BufMut, BytesMut};
use tokio::net::UdpSocket;
use tracing::{instrument, warn};

use crate::error::Result;
use crate::txn::UpstreamKind;

/// Wire-level message kind (§3 "collector tuple"). Matches `MESSAGE_REQUEST`
/// / `MESSAGE_RESPONSE` in the reference collector protocol.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ReportKind {
    Request = 0,
    Response = 1,
}

/// One outbound telemetry record. Encodes to exactly `type(i32) id(i32)
/// timestamp(i64) buffer(..)` on the wire — the reference's `message_t` has
/// a leading `length` field too, but it is never transmitted (the sender
/// computes an offset past it before handing the pointer to `sendto`), so
/// encoding it here would desync every collector that speaks the real
/// protocol.
pub struct Report {
    pub kind: ReportKind,
    pub id: i64,
    pub timestamp_us: i64,
    pub buffer: BytesMut,
}

impl Report {
    fn encode(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(4 + 4 + 8 + self.buffer.len());
        out.put_i32_le(self.kind as i32);
        out.put_i32_le(self.id as i32);
        out.put_i64_le(self.timestamp_us);
        out.put_slice(&self.buffer);
        out
    }
}

/// Reporter admission + UDP transmission (module F, §4.F). One instance per
/// process, shared across all transaction tasks.
///
/// Admission policy, reproduced exactly from `http_proxy.cpp`'s `cnt`
/// bookkeeping: while under `quota`, every request/response pair is
/// reported and the quota counter advances. Once exhausted, only two
/// anomalous shapes still get through: a trusted-upstream response slower
/// than 500ms, or a sandbox response faster than 500ms. Ordinary sandbox
/// latency and ordinary trusted latency are silently dropped past quota.
pub struct Reporter {
    socket: UdpSocket,
    quota: u64,
    sent: AtomicU64,
}

const SLOW_THRESHOLD_US: i64 = 500_000;

impl Reporter {
    pub async fn bind(collector: SocketAddr, quota: u64) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(collector).await?;
        Ok(Reporter {
            socket,
            quota,
            sent: AtomicU64::new(0),
        })
    }

    /// Reports the request/response pair for one transaction if admitted,
    /// given the already-computed backend latency in microseconds.
    #[instrument(skip(self, req, res))]
    pub async fn report_pair(&self, kind: UpstreamKind, latency_us: i64, req: Report, res: Report) {
        if !self.admit(kind, latency_us) {
            return;
        }
        if let Err(e) = self.send(&req).await {
            warn!(error = %e, "failed to send request report");
        }
        if let Err(e) = self.send(&res).await {
            warn!(error = %e, "failed to send response report");
        }
    }

    fn admit(&self, kind: UpstreamKind, latency_us: i64) -> bool {
        let under_quota = self
            .sent
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.quota).then_some(n + 1)
            })
            .is_ok();
        if under_quota {
            return true;
        }
        match kind {
            UpstreamKind::Trusted(_) => latency_us >= SLOW_THRESHOLD_US,
            UpstreamKind::Sandbox => latency_us < SLOW_THRESHOLD_US,
        }
    }

    async fn send(&self, report: &Report) -> Result<()> {
        let encoded = report.encode();
        self.socket.send(&encoded).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pair(kind: UpstreamKind, quota: u64, sent: u64, latency_us: i64) -> bool {
        let collector = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let reporter = Reporter::bind(collector.local_addr().unwrap(), quota).await.unwrap();
        reporter.sent.store(sent, Ordering::Relaxed);
        reporter.admit(kind, latency_us)
    }

    #[tokio::test]
    async fn under_quota_always_admits() {
        assert!(pair(UpstreamKind::Trusted(0), 1000, 5, 10).await);
    }

    #[tokio::test]
    async fn past_quota_admits_slow_trusted() {
        assert!(pair(UpstreamKind::Trusted(0), 0, 0, 600_000).await);
        assert!(!pair(UpstreamKind::Trusted(0), 0, 0, 10).await);
    }

    #[tokio::test]
    async fn past_quota_admits_fast_sandbox() {
        assert!(pair(UpstreamKind::Sandbox, 0, 0, 10).await);
        assert!(!pair(UpstreamKind::Sandbox, 0, 0, 600_000).await);
    }

    #[test]
    fn report_encodes_without_length_field() {
        let report = Report {
            kind: ReportKind::Request,
            id: 7,
            timestamp_us: 42,
            buffer: BytesMut::from(&b"GET /"[..]),
        };
        let encoded = report.encode();
        assert_eq!(&encoded[0..4], &0i32.to_le_bytes());
        assert_eq!(&encoded[4..8], &7i32.to_le_bytes());
        assert_eq!(&encoded[8..16], &42i64.to_le_bytes());
        assert_eq!(&encoded[16..], b"GET /");
    }
}
