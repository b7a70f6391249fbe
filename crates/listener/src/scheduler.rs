//! The polling loop.
//!
//! Each cycle sleeps, polls the source once and, if an alert arrived, runs it
//! through the processor before the next cycle starts. Cancellation is only
//! observed while sleeping or polling, so an alert is never half processed.

use async_trait::async_trait;
use color_eyre::eyre::Report;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use crate::config::PollingConfig;
use crate::error::{ListenerError, SourceError};
use crate::notify::OperatorChannel;
use crate::processor::{AlertProcessor, ProcessOutcome};
use crate::source::AlertSource;

#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
    async fn sleep(&self, duration: Duration);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug)]
pub enum CycleOutcome {
    Cancelled,
    /// The poll timed out, or delivered a payload that could not be decoded.
    Idle,
    Processed(ProcessOutcome),
}

pub struct PollingScheduler<S> {
    source: S,
    processor: AlertProcessor,
    clock: Arc<dyn Clock>,
    sleep_time: Duration,
    poll_timeout: Duration,
    cancel: CancellationToken,
}

impl<S: AlertSource> PollingScheduler<S> {
    pub fn new(
        source: S,
        processor: AlertProcessor,
        polling: &PollingConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            processor,
            clock: Arc::new(SystemClock),
            sleep_time: polling.sleep_time(),
            poll_timeout: polling.poll_timeout(),
            cancel,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn processor(&self) -> &AlertProcessor {
        &self.processor
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Runs cycles until cancelled. Returns `Err` only for failures the loop
    /// cannot carry on from.
    #[tracing::instrument(skip_all)]
    pub async fn run(&mut self) -> Result<(), ListenerError> {
        tracing::info!(
            name = "scheduler.start",
            target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
            sleep_secs = self.sleep_time.as_secs(),
            poll_timeout_secs = self.poll_timeout.as_secs(),
            message = "Starting polling loop"
        );
        loop {
            if let CycleOutcome::Cancelled = self.run_cycle().await? {
                tracing::info!(
                    name = "scheduler.stop",
                    target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
                    message = "Polling loop cancelled"
                );
                return Ok(());
            }
        }
    }

    pub async fn run_cycle(&mut self) -> Result<CycleOutcome, ListenerError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(CycleOutcome::Cancelled),
            _ = self.clock.sleep(self.sleep_time) => {}
        }

        tracing::debug!(timeout = ?self.poll_timeout, "polling for alerts");
        let polled = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(CycleOutcome::Cancelled),
            polled = self.source.poll(self.poll_timeout) => polled,
        };

        let consumed = match polled {
            Ok(Some(consumed)) => consumed,
            Ok(None) => return Ok(CycleOutcome::Idle),
            Err(SourceError::Decode(reason)) => {
                tracing::warn!(
                    name = "scheduler.poll.undecodable",
                    target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
                    reason = %reason,
                    message = "Dropping undecodable alert payload"
                );
                return Ok(CycleOutcome::Idle);
            }
            Err(e) => return Err(e.into()),
        };

        tracing::info!(
            name = "scheduler.alert_received",
            target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
            topic = %consumed.topic,
            object_id = %consumed.alert.object_id,
            message = "New alert"
        );
        let now = self.clock.now();
        let outcome = self.processor.process(&consumed, now).await?;
        Ok(CycleOutcome::Processed(outcome))
    }
}

impl<S: AlertSource + 'static> PollingScheduler<S> {
    /// Runs the loop on its own task. Whatever ends it other than
    /// cancellation, a panic included, is reported to `operators` as a crash.
    pub async fn supervise(self, operators: &OperatorChannel) -> color_eyre::eyre::Result<()> {
        let mut scheduler = self;
        let report = match tokio::spawn(async move { scheduler.run().await }).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => Report::new(e),
            Err(join) => Report::new(join_failure(join)),
        };
        Err(report_crash(operators, report).await)
    }
}

/// Sends the crash report to the operators and hands the report back.
pub async fn report_crash(operators: &OperatorChannel, report: Report) -> Report {
    operators
        .report(&format!("CRASH!\n\nfull traceback:\n{report:?}"), Level::ERROR)
        .await;
    report
}

fn join_failure(join: JoinError) -> ListenerError {
    if !join.is_panic() {
        return ListenerError::Aborted(join.to_string());
    }
    let payload = join.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    ListenerError::Panicked(message)
}
