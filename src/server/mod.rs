//! Loopback query endpoint.
//!
//! One listener task accepts connections; each connection gets its own task
//! and serves any number of requests until the peer hangs up. A request is a
//! 1-byte method selector plus a 4-byte little-endian sample count; the
//! response is a 4-byte little-endian length prefix followed by the payload
//! of [`wire`]. A count larger than the ring holds clamps to what is held.
//!
//! The ring's shared lock is held only while copying the snapshot out;
//! encoding happens on the copy.

pub mod wire;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::export::health::HealthMetrics;
use crate::identity::IdentityCache;
use crate::model::now_ns;
use crate::ring::SampleRing;

/// Method selector for `readSamples`.
pub const METHOD_READ_SAMPLES: u8 = 1;
/// Method selector for `readSys`.
pub const METHOD_READ_SYS: u8 = 2;

pub struct QueryServer {
    ring: Arc<SampleRing>,
    identities: Arc<IdentityCache>,
    interval_ms: u32,
    health: Arc<HealthMetrics>,
}

impl QueryServer {
    pub fn new(
        ring: Arc<SampleRing>,
        identities: Arc<IdentityCache>,
        interval_ms: u32,
        health: Arc<HealthMetrics>,
    ) -> Self {
        Self {
            ring,
            identities,
            interval_ms,
            health,
        }
    }

    /// Accepts connections until cancellation.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<()> {
        let addr = listener.local_addr().context("getting listener address")?;
        info!(%addr, "query endpoint listening");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("query endpoint stopped");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(x) => x,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    debug!(%peer, "client connected");

                    let server = Arc::clone(&self);
                    let conn_cancel = cancel.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = conn_cancel.cancelled() => {}
                            result = server.handle_conn(stream) => {
                                if let Err(e) = result {
                                    debug!(%peer, error = %e, "connection closed");
                                }
                            }
                        }
                    });
                }
            }
        }
    }

    async fn handle_conn(&self, mut stream: TcpStream) -> Result<()> {
        loop {
            let mut request = [0u8; 5];
            if stream.read_exact(&mut request).await.is_err() {
                // Peer hung up between requests.
                return Ok(());
            }

            let method = request[0];
            let count = u32::from_le_bytes([request[1], request[2], request[3], request[4]]);

            let payload = match method {
                METHOD_READ_SAMPLES => {
                    self.health
                        .queries_total
                        .with_label_values(&["readSamples"])
                        .inc();
                    self.build_samples_response(count)
                }
                METHOD_READ_SYS => {
                    self.health
                        .queries_total
                        .with_label_values(&["readSys"])
                        .inc();
                    self.build_sys_response(count)
                }
                other => {
                    anyhow::bail!("unhandled method: {other}");
                }
            };

            stream
                .write_all(&(payload.len() as u32).to_le_bytes())
                .await
                .context("writing response length")?;
            stream
                .write_all(&payload)
                .await
                .context("writing response payload")?;
        }
    }

    /// Materializes a `readSamples` payload for the last `n` entries.
    pub fn build_samples_response(&self, n: u32) -> Vec<u8> {
        let entries = self.ring.snapshot_last(n);
        let identities = self.identities.snapshot();

        let mut out = Vec::new();
        wire::encode_samples(&mut out, now_ns(), &identities, self.interval_ms, &entries);
        out
    }

    /// Materializes a `readSys` payload for the last `n` entries.
    pub fn build_sys_response(&self, n: u32) -> Vec<u8> {
        let entries = self.ring.snapshot_last(n);

        let mut out = Vec::new();
        wire::encode_sys(&mut out, now_ns(), &entries);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SystemSample;

    fn test_server(entries: usize) -> Arc<QueryServer> {
        let ring = Arc::new(SampleRing::new(4, 2));
        for i in 0..entries {
            let mut slot = ring.reserve_write();
            let entry = slot.entry();
            entry.procs.clear();
            entry.sys = SystemSample {
                capture_time_ns: i as i64,
                ctxt: i as u64,
                ..SystemSample::default()
            };
            slot.commit();
        }

        let health = Arc::new(HealthMetrics::new(":0").expect("metrics"));
        Arc::new(QueryServer::new(
            ring,
            Arc::new(IdentityCache::new()),
            200,
            health,
        ))
    }

    #[test]
    fn test_samples_response_clamps_to_held() {
        let server = test_server(2);
        let payload = server.build_samples_response(100);
        let decoded = wire::decode_samples(&payload).expect("decode");
        assert_eq!(decoded.entries.len(), 2);
        assert_eq!(decoded.interval_ms, 200);
    }

    #[test]
    fn test_sys_response_is_oldest_first() {
        let server = test_server(3);
        let payload = server.build_sys_response(2);
        let decoded = wire::decode_sys(&payload).expect("decode");
        assert_eq!(decoded.samples.len(), 2);
        assert!(decoded.samples[0].capture_time_ns < decoded.samples[1].capture_time_ns);
    }

    #[tokio::test]
    async fn test_end_to_end_request_response() {
        let server = test_server(3);
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let cancel = CancellationToken::new();

        let serve_cancel = cancel.clone();
        let handle = tokio::spawn(Arc::clone(&server).serve(listener, serve_cancel));

        let mut stream = TcpStream::connect(addr).await.expect("connect");

        // readSys for up to 10 samples.
        let mut request = vec![METHOD_READ_SYS];
        request.extend_from_slice(&10u32.to_le_bytes());
        stream.write_all(&request).await.expect("send");

        let mut len_raw = [0u8; 4];
        stream.read_exact(&mut len_raw).await.expect("read length");
        let len = u32::from_le_bytes(len_raw) as usize;

        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await.expect("read payload");

        let decoded = wire::decode_sys(&payload).expect("decode");
        assert_eq!(decoded.samples.len(), 3);

        cancel.cancel();
        let _ = handle.await;
    }
}
