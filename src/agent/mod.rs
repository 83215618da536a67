//! Telemetry agent: polls local statistics and reports them to a collector.
//!
//! Poll and report run on independent timers. A report takes a copy of the
//! latest snapshot, streams generated requests through a bounded queue and
//! lets the poster drain it.

pub mod generator;
pub mod poller;
pub mod poster;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rsa::RsaPublicKey;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::codec::Encoder;
use crate::metric::POLL_COUNT;
use crate::retry::RetryPolicy;

pub use generator::{GenerateError, Generator, OutboundRequest};
pub use poller::Poller;
pub use poster::{CycleSummary, Poster};

/// Runtime settings of the agent, resolved from configuration.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub address: String,
    pub poll_interval: Duration,
    pub report_interval: Duration,
    pub rate_limit: usize,
    pub hash_key: Option<String>,
    pub public_key: Option<RsaPublicKey>,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

pub struct Agent {
    poller: Poller,
    generator: Generator,
    poster: Poster,
    poll_interval: Duration,
    report_interval: Duration,
    reported_ticks: AtomicU64,
}

impl Agent {
    pub fn new(settings: AgentSettings) -> anyhow::Result<Self> {
        let poster = Poster::new(
            &settings.address,
            settings.rate_limit,
            settings.request_timeout,
            settings.retry,
        )?;
        Ok(Self {
            poller: Poller::new(),
            generator: Generator::new(Encoder::new(settings.hash_key, settings.public_key)),
            poster,
            poll_interval: settings.poll_interval,
            report_interval: settings.report_interval,
            reported_ticks: AtomicU64::new(0),
        })
    }

    pub fn poller(&self) -> &Poller {
        &self.poller
    }

    /// Runs both timers until `shutdown` fires. A tick already in progress
    /// completes; no new tick starts afterwards.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            poll = ?self.poll_interval,
            report = ?self.report_interval,
            "Agent started"
        );

        let poll = tokio::spawn(Arc::clone(&self).poll_loop(shutdown.clone()));
        let report = tokio::spawn(Arc::clone(&self).report_loop(shutdown));

        let (poll, report) = tokio::join!(poll, report);
        for joined in [poll, report] {
            if let Err(e) = joined {
                error!(error = %e, "Agent task failed");
            }
        }
        info!("Agent stopped");
    }

    async fn poll_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.poller.refresh().await,
            }
        }
    }

    async fn report_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.report_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Let the poller fill the snapshot before the first report.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.report().await;
                }
            }
        }
    }

    /// One report cycle.
    ///
    /// `PollCount` carries the number of polls since the previous report, so
    /// the collector's running counter equals the total number of polls.
    #[instrument(skip(self))]
    pub async fn report(&self) -> CycleSummary {
        let mut snapshot = self.poller.snapshot();
        let ticks = self.poller.poll_count();
        let previous = self.reported_ticks.swap(ticks, Ordering::SeqCst);
        let delta = i64::try_from(ticks.saturating_sub(previous)).unwrap_or(i64::MAX);
        snapshot.set_counter(POLL_COUNT, delta);

        let (tx, rx) = mpsc::channel(self.poster.rate_limit());
        let generator = self.generator.clone();
        let producer = tokio::task::spawn_blocking(move || {
            let mut errors = Vec::new();
            for item in generator.generate(&snapshot) {
                match item {
                    Ok(request) => {
                        if tx.blocking_send(request).is_err() {
                            break;
                        }
                    }
                    Err(e) => errors.push(e),
                }
            }
            errors
        });

        let summary = self.poster.post(rx).await;

        match producer.await {
            Ok(errors) if errors.is_empty() => {}
            Ok(errors) => {
                warn!(count = errors.len(), "Request generation reported errors");
                for e in &errors {
                    debug!(error = %e, "Generation error");
                }
            }
            Err(e) => error!(error = %e, "Request generator task failed"),
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> AgentSettings {
        AgentSettings {
            address: "127.0.0.1:9".into(),
            poll_interval: Duration::from_millis(10),
            report_interval: Duration::from_millis(50),
            rate_limit: 4,
            hash_key: None,
            public_key: None,
            request_timeout: Duration::from_millis(200),
            retry: RetryPolicy {
                attempts: 1,
                ..RetryPolicy::immediate()
            },
        }
    }

    #[tokio::test]
    async fn test_report_sends_every_generated_request() {
        let agent = Agent::new(settings()).unwrap();
        agent.poller().refresh().await;
        let series = agent.poller().snapshot().len() as u64 + 1;

        let summary = agent.report().await;
        assert_eq!(summary.requests, series * 3 + 2);
        assert_eq!(summary.failures, summary.requests);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let agent = Arc::new(Agent::new(settings()).unwrap());
        let token = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&agent).run(token.clone()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(agent.poller().poll_count() >= 1);
    }
}
