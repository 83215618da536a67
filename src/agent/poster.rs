//! Bounded-concurrency delivery of outbound requests.
//!
//! One report cycle drains a bounded queue. At most `rate_limit` workers are
//! in flight; each takes one request, sends it with retries and exits.

use std::net::{IpAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use super::generator::OutboundRequest;
use crate::codec::SIGNATURE_HEADER;
use crate::retry::RetryPolicy;

pub const REAL_IP_HEADER: &str = "X-Real-IP";

#[derive(Debug, Error)]
pub enum PostError {
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("server answered {0}")]
    Status(StatusCode),
}

impl PostError {
    /// Connection failures, timeouts, 429 and 5xx are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            PostError::Transport(e) => e.is_connect() || e.is_timeout(),
            PostError::Status(s) => *s == StatusCode::TOO_MANY_REQUESTS || s.is_server_error(),
        }
    }
}

/// Per-cycle delivery counters.
#[derive(Debug, Default)]
pub struct PostStats {
    requests: AtomicU64,
    attempts: AtomicU64,
    failures: AtomicU64,
}

/// Counter values captured at the end of a cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub requests: u64,
    pub attempts: u64,
    pub failures: u64,
}

impl PostStats {
    /// Returns the current values and zeroes the counters.
    pub fn take(&self) -> CycleSummary {
        CycleSummary {
            requests: self.requests.swap(0, Ordering::SeqCst),
            attempts: self.attempts.swap(0, Ordering::SeqCst),
            failures: self.failures.swap(0, Ordering::SeqCst),
        }
    }
}

/// Local address the OS would use to reach `address` (`host:port`).
pub fn local_ip_for(address: &str) -> Option<IpAddr> {
    let target = address.to_socket_addrs().ok()?.next()?;
    let bind = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind).ok()?;
    socket.connect(target).ok()?;
    Some(socket.local_addr().ok()?.ip())
}

#[derive(Clone)]
pub struct Poster {
    client: reqwest::Client,
    base_url: String,
    rate_limit: usize,
    retry: RetryPolicy,
    real_ip: Option<IpAddr>,
    stats: Arc<PostStats>,
}

impl Poster {
    /// `address` is the collector `host:port`, with or without a scheme.
    pub fn new(
        address: &str,
        rate_limit: usize,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        let (base_url, host_port) = match address.split_once("://") {
            Some((_, rest)) => (address.trim_end_matches('/').to_string(), rest),
            None => (format!("http://{}", address.trim_end_matches('/')), address),
        };
        let real_ip = local_ip_for(host_port.trim_end_matches('/'));
        debug!(%base_url, ?real_ip, "Poster configured");

        Ok(Self {
            client,
            base_url,
            rate_limit: rate_limit.max(1),
            retry,
            real_ip,
            stats: Arc::new(PostStats::default()),
        })
    }

    pub fn rate_limit(&self) -> usize {
        self.rate_limit
    }

    /// Sends everything received on `queue` until the sender side closes,
    /// then logs and resets the cycle counters.
    #[instrument(skip_all)]
    pub async fn post(&self, mut queue: mpsc::Receiver<OutboundRequest>) -> CycleSummary {
        let semaphore = Arc::new(Semaphore::new(self.rate_limit));
        let mut workers = JoinSet::new();

        loop {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let Some(request) = queue.recv().await else {
                break;
            };
            let poster = self.clone();
            workers.spawn(async move {
                let _permit = permit;
                poster.execute(request).await;
            });
            while let Some(joined) = workers.try_join_next() {
                if let Err(e) = joined {
                    warn!(error = %e, "Poster worker join failed");
                }
            }
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Poster worker join failed");
            }
        }

        let summary = self.stats.take();
        info!(
            requests = summary.requests,
            attempts = summary.attempts,
            failures = summary.failures,
            "Report cycle finished"
        );
        summary
    }

    async fn execute(&self, request: OutboundRequest) {
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        let url = format!("{}{}", self.base_url, request.path);

        let (target, body) = (url.as_str(), &request);
        let result = self
            .retry
            .run(
                |_| async move { self.send_once(target, body).await },
                PostError::is_transient,
            )
            .await;

        match result {
            Ok(status) => debug!(%url, %status, "Request delivered"),
            Err(e) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                warn!(%url, error = %e, "Request failed");
            }
        }
    }

    async fn send_once(&self, url: &str, request: &OutboundRequest) -> Result<StatusCode, PostError> {
        self.stats.attempts.fetch_add(1, Ordering::Relaxed);

        let mut builder = self
            .client
            .post(url)
            .header(CONTENT_TYPE, request.content_type)
            .body(request.body.clone());
        if request.gzip {
            builder = builder.header(CONTENT_ENCODING, "gzip");
        }
        if let Some(signature) = &request.signature {
            builder = builder.header(SIGNATURE_HEADER, signature);
        }
        if let Some(ip) = self.real_ip {
            builder = builder.header(REAL_IP_HEADER, ip.to_string());
        }

        let status = builder.send().await?.status();
        if status.is_success() {
            Ok(status)
        } else {
            Err(PostError::Status(status))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(PostError::Status(StatusCode::TOO_MANY_REQUESTS).is_transient());
        assert!(PostError::Status(StatusCode::BAD_GATEWAY).is_transient());
        assert!(!PostError::Status(StatusCode::BAD_REQUEST).is_transient());
        assert!(!PostError::Status(StatusCode::NOT_FOUND).is_transient());
    }

    #[test]
    fn test_stats_reset_on_take() {
        let stats = PostStats::default();
        stats.requests.fetch_add(3, Ordering::Relaxed);
        stats.failures.fetch_add(1, Ordering::Relaxed);
        assert_eq!(
            stats.take(),
            CycleSummary {
                requests: 3,
                attempts: 0,
                failures: 1
            }
        );
        assert_eq!(stats.take(), CycleSummary::default());
    }

    #[test]
    fn test_local_ip_for_loopback() {
        assert_eq!(
            local_ip_for("127.0.0.1:8080"),
            Some("127.0.0.1".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn test_unreachable_collector_counts_failures() {
        // Nothing listens on port 9 of the loopback interface.
        let poster = Poster::new(
            "127.0.0.1:9",
            2,
            Duration::from_millis(500),
            RetryPolicy::immediate(),
        )
        .unwrap();

        let (tx, rx) = mpsc::channel(poster.rate_limit());
        let producer = tokio::spawn(async move {
            for i in 0..5 {
                let request = OutboundRequest {
                    path: format!("/update/counter/c/{i}"),
                    body: Vec::new(),
                    content_type: "text/plain",
                    gzip: false,
                    signature: None,
                };
                tx.send(request).await.unwrap();
            }
        });

        let summary = poster.post(rx).await;
        producer.await.unwrap();
        assert_eq!(summary.requests, 5);
        assert_eq!(summary.failures, 5);
        assert_eq!(summary.attempts, 15);
    }
}
