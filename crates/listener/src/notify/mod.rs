//! Notification fanout to subscribers, and the operator channel.
//!
//! Every subscriber is served in turn. A failure only ends delivery to the
//! recipient it happened for; the batch as a whole always completes and at
//! most one escalation reaches the operators.

pub mod email;
pub mod recipients;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::Level;

use crate::config::OperatorConfig;
use crate::error::DeliveryError;

pub use email::EmailNotifier;
pub use recipients::{FileRecipientDirectory, RecipientDirectory, RecipientSet, StaticRecipients};

/// Prefix on every message addressed to operators.
pub const OPERATOR_PREFIX: &str = "sudo report: ";

/// Per-recipient delivery of texts and images. Recipients are opaque channel
/// identifiers; what they mean is up to the implementation.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_text(&self, recipient: &str, text: &str) -> Result<(), DeliveryError>;
    async fn send_image(&self, recipient: &str, path: &Path) -> Result<(), DeliveryError>;
}

/// What one processed alert sends to every recipient: texts first, then
/// images, each in order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NotificationBatch {
    pub texts: Vec<String>,
    pub images: Vec<PathBuf>,
}

impl NotificationBatch {
    pub fn new(text: impl Into<String>, images: Vec<PathBuf>) -> Self {
        Self {
            texts: vec![text.into()],
            images,
        }
    }

    pub fn len(&self) -> usize {
        self.texts.len() + self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.texts.is_empty() && self.images.is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FanoutReport {
    pub delivered: Vec<String>,
    pub failed: Vec<String>,
}

impl FanoutReport {
    pub fn all_delivered(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Status messages for the people running the listener: start-up, crashes and
/// fanout escalations. Never used for alert content.
#[derive(Clone)]
pub struct OperatorChannel {
    notifier: Arc<dyn Notifier>,
    operators: Vec<String>,
}

impl OperatorChannel {
    pub fn new(notifier: Arc<dyn Notifier>, operators: Vec<String>) -> Self {
        Self {
            notifier,
            operators,
        }
    }

    /// Operators are the sudoers, or the test users when in test mode.
    pub fn from_config(notifier: Arc<dyn Notifier>, cfg: &OperatorConfig, test_mode: bool) -> Self {
        let operators = if test_mode {
            cfg.test_users.clone()
        } else {
            cfg.sudoers.clone()
        };
        Self::new(notifier, operators)
    }

    pub fn operators(&self) -> &[String] {
        &self.operators
    }

    /// Logs `message` at `level` and forwards it to every operator. Returns how
    /// many operators it reached; failures to reach one are only logged.
    pub async fn report(&self, message: &str, level: Level) -> usize {
        let text = format!("{OPERATOR_PREFIX}{message}");
        match level {
            Level::ERROR => tracing::error!("{text}"),
            Level::WARN => tracing::warn!("{text}"),
            _ => tracing::info!("{text}"),
        }
        let mut reached = 0;
        for operator in &self.operators {
            match self.notifier.send_text(operator, &text).await {
                Ok(()) => reached += 1,
                Err(e) => tracing::error!(
                    name = "notify.operator.failed",
                    target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
                    operator = %operator,
                    error = %e,
                    message = "Failed to reach operator"
                ),
            }
        }
        reached
    }
}

pub struct NotificationFanout {
    notifier: Arc<dyn Notifier>,
    operators: OperatorChannel,
}

impl NotificationFanout {
    pub fn new(notifier: Arc<dyn Notifier>, operators: OperatorChannel) -> Self {
        Self {
            notifier,
            operators,
        }
    }

    pub fn operators(&self) -> &OperatorChannel {
        &self.operators
    }

    #[tracing::instrument(
        skip_all,
        fields(recipients = recipients.len(), items = batch.len())
    )]
    pub async fn deliver(
        &self,
        batch: &NotificationBatch,
        recipients: &RecipientSet,
    ) -> FanoutReport {
        let mut report = FanoutReport::default();
        for recipient in recipients.iter() {
            match self.deliver_to(recipient, batch).await {
                Ok(()) => report.delivered.push(recipient.to_string()),
                Err(e) => {
                    tracing::warn!(
                        name = "notify.fanout.recipient_failed",
                        target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
                        recipient = %recipient,
                        error = %e,
                        message = "Delivery failed, moving on to next recipient"
                    );
                    report.failed.push(recipient.to_string());
                }
            }
        }

        if !report.failed.is_empty() {
            let message = format!(
                "\nerror updating {} users\n(bot still running)",
                report.failed.len()
            );
            self.operators.report(&message, Level::WARN).await;
        }

        tracing::info!(
            name = "notify.fanout.complete",
            target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            message = "Notification batch delivered"
        );
        report
    }

    async fn deliver_to(
        &self,
        recipient: &str,
        batch: &NotificationBatch,
    ) -> Result<(), DeliveryError> {
        for text in &batch.texts {
            self.notifier.send_text(recipient, text).await?;
        }
        for image in &batch.images {
            self.notifier.send_image(recipient, image).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Clone, Debug, PartialEq)]
    pub(crate) enum Sent {
        Text(String, String),
        Image(String, PathBuf),
    }

    /// Records every send; recipients in `failing` error on their
    /// `fail_after`-th item.
    #[derive(Default)]
    pub(crate) struct RecordingNotifier {
        pub(crate) sent: Mutex<Vec<Sent>>,
        pub(crate) failing: HashSet<String>,
        pub(crate) fail_after: usize,
    }

    impl RecordingNotifier {
        pub(crate) fn failing(ids: &[&str], fail_after: usize) -> Self {
            Self {
                failing: ids.iter().map(|s| s.to_string()).collect(),
                fail_after,
                ..Default::default()
            }
        }

        pub(crate) fn sent_to(&self, recipient: &str) -> Vec<Sent> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|s| match s {
                    Sent::Text(r, _) | Sent::Image(r, _) => r == recipient,
                })
                .cloned()
                .collect()
        }

        fn check(&self, recipient: &str) -> Result<(), DeliveryError> {
            if self.failing.contains(recipient)
                && self.sent_to(recipient).len() >= self.fail_after
            {
                return Err(DeliveryError::Transport(format!("{recipient} unreachable")));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send_text(&self, recipient: &str, text: &str) -> Result<(), DeliveryError> {
            self.check(recipient)?;
            self.sent
                .lock()
                .unwrap()
                .push(Sent::Text(recipient.into(), text.into()));
            Ok(())
        }

        async fn send_image(&self, recipient: &str, path: &Path) -> Result<(), DeliveryError> {
            self.check(recipient)?;
            self.sent
                .lock()
                .unwrap()
                .push(Sent::Image(recipient.into(), path.to_path_buf()));
            Ok(())
        }
    }

    fn batch() -> NotificationBatch {
        NotificationBatch::new("hello", vec!["a.png".into(), "b.png".into()])
    }

    fn fanout(notifier: &Arc<RecordingNotifier>) -> NotificationFanout {
        let shared: Arc<dyn Notifier> = notifier.clone();
        NotificationFanout::new(shared.clone(), OperatorChannel::new(shared, vec!["ops".into()]))
    }

    #[tokio::test]
    async fn texts_go_before_images() {
        let notifier = Arc::new(RecordingNotifier::default());
        let report = fanout(&notifier)
            .deliver(&batch(), &RecipientSet::new(vec!["alice".into()]))
            .await;
        assert!(report.all_delivered());
        assert_eq!(
            notifier.sent_to("alice"),
            vec![
                Sent::Text("alice".into(), "hello".into()),
                Sent::Image("alice".into(), "a.png".into()),
                Sent::Image("alice".into(), "b.png".into()),
            ]
        );
        assert!(notifier.sent_to("ops").is_empty());
    }

    #[tokio::test]
    async fn failure_stops_only_that_recipient() {
        let notifier = Arc::new(RecordingNotifier::failing(&["bob"], 1));
        let recipients = RecipientSet::new(vec!["alice".into(), "bob".into(), "carol".into()]);
        let report = fanout(&notifier).deliver(&batch(), &recipients).await;

        assert_eq!(report.delivered, vec!["alice".to_string(), "carol".to_string()]);
        assert_eq!(report.failed, vec!["bob".to_string()]);
        // Bob got the text before his image send failed.
        assert_eq!(notifier.sent_to("bob").len(), 1);
        assert_eq!(notifier.sent_to("carol").len(), 3);

        let ops = notifier.sent_to("ops");
        assert_eq!(ops.len(), 1);
        assert_eq!(
            ops[0],
            Sent::Text(
                "ops".into(),
                "sudo report: \nerror updating 1 users\n(bot still running)".into()
            )
        );
    }

    #[tokio::test]
    async fn many_failures_escalate_once() {
        let notifier = Arc::new(RecordingNotifier::failing(&["a", "b", "c"], 0));
        let recipients = RecipientSet::new(vec!["a".into(), "b".into(), "c".into(), "d".into()]);
        let report = fanout(&notifier).deliver(&batch(), &recipients).await;
        assert_eq!(report.failed.len(), 3);
        assert_eq!(notifier.sent_to("d").len(), 3);
        assert_eq!(notifier.sent_to("ops").len(), 1);
    }

    #[tokio::test]
    async fn operator_channel_uses_test_users_in_test_mode() {
        let notifier = Arc::new(RecordingNotifier::default());
        let cfg = OperatorConfig {
            sudoers: vec!["root".into()],
            test_users: vec!["dev".into()],
        };
        let channel = OperatorChannel::from_config(notifier.clone(), &cfg, true);
        assert_eq!(channel.report("starting bot on host", Level::INFO).await, 1);
        assert!(notifier.sent_to("root").is_empty());
        assert_eq!(
            notifier.sent_to("dev"),
            vec![Sent::Text("dev".into(), "sudo report: starting bot on host".into())]
        );
    }
}
