//! A listener for kilonova candidate alerts.
//!
//! Alerts are consumed from the broker stream, archived, given a light curve
//! (fetching the full history when the embedded one is incomplete), rendered
//! into a light curve and observing charts, and mailed to subscribers.

use std::sync::Arc;

use crate::config::AppConfig;
use crate::enrich::{AppendPolicy, HistorySource, LightcurveEnricher};
use crate::notify::{FileRecipientDirectory, NotificationFanout, Notifier, OperatorChannel};
use crate::processor::AlertProcessor;
use crate::sky::ObservingSite;

pub mod alert;
pub mod archive;
pub mod broker;
pub mod config;
pub mod enrich;
pub mod error;
pub mod notify;
pub mod paths;
pub mod processor;
pub mod render;
pub mod scheduler;
pub mod sky;
pub mod source;
pub mod stamps;
pub mod tls;

/// Long-lived collaborators shared by the processor and the binary.
#[derive(Clone)]
pub struct AppResources {
    pub config: Arc<AppConfig>,
    pub notifier: Arc<dyn Notifier>,
    pub history: Arc<dyn HistorySource>,
    pub test_mode: bool,
}

impl AppResources {
    pub fn operator_channel(&self) -> OperatorChannel {
        OperatorChannel::from_config(self.notifier.clone(), &self.config.operators, self.test_mode)
    }

    pub fn recipient_directory(&self) -> FileRecipientDirectory {
        let directory = FileRecipientDirectory::new(self.config.recipients_path());
        if self.test_mode {
            directory.with_test_users(self.config.operators.test_users.clone())
        } else {
            directory
        }
    }

    pub fn processor(&self) -> AlertProcessor {
        let enricher = LightcurveEnricher::new(
            self.history.clone(),
            AppendPolicy::from_flag(self.config.lightcurve.append_latest_candidate),
        );
        let fanout = NotificationFanout::new(self.notifier.clone(), self.operator_channel());
        AlertProcessor::new(
            self.config.paths(),
            enricher,
            Arc::new(self.recipient_directory()),
            fanout,
        )
        .with_sites(self.config.sites.iter().map(ObservingSite::from).collect())
    }
}
