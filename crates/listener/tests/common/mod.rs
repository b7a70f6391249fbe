#![allow(dead_code)]

use async_trait::async_trait;
use kn_alert_listener::alert::{Alert, Candidate, ConsumedAlert, PrvCandidate};
use kn_alert_listener::enrich::{AppendPolicy, HistorySource, LightcurveEnricher};
use kn_alert_listener::error::DeliveryError;
use kn_alert_listener::notify::{
    NotificationFanout, Notifier, OperatorChannel, RecipientSet, StaticRecipients,
};
use kn_alert_listener::paths::ListenerPaths;
use kn_alert_listener::processor::AlertProcessor;
use kn_alert_listener::sky::ObservingSite;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub const TOPIC: &str = "fink_kn_candidates_ztf";
pub const OPERATOR: &str = "ops@example.com";

#[derive(Clone, Debug, PartialEq)]
pub enum Sent {
    Text(String),
    Image(PathBuf),
}

/// Records deliveries per recipient. Recipients listed in `failing` error on
/// every send.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(String, Sent)>>,
    failing: HashSet<String>,
}

impl RecordingNotifier {
    pub fn failing(ids: &[&str]) -> Self {
        Self {
            failing: ids.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn sent_to(&self, recipient: &str) -> Vec<Sent> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(r, _)| r == recipient)
            .map(|(_, s)| s.clone())
            .collect()
    }

    pub fn total(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    fn record(&self, recipient: &str, item: Sent) -> Result<(), DeliveryError> {
        if self.failing.contains(recipient) {
            return Err(DeliveryError::Transport(format!("{recipient} is unreachable")));
        }
        self.sent.lock().unwrap().push((recipient.to_string(), item));
        Ok(())
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_text(&self, recipient: &str, text: &str) -> Result<(), DeliveryError> {
        self.record(recipient, Sent::Text(text.to_string()))
    }

    async fn send_image(&self, recipient: &str, path: &Path) -> Result<(), DeliveryError> {
        self.record(recipient, Sent::Image(path.to_path_buf()))
    }
}

pub fn la_silla() -> ObservingSite {
    ObservingSite {
        name: Some("La Silla Observatory".into()),
        latitude: -29.2567,
        longitude: -70.7346,
        height_m: 2347.0,
    }
}

pub fn detection(jd: f64, fid: i32, mag: f64) -> PrvCandidate {
    PrvCandidate {
        jd,
        fid,
        magpsf: Some(mag),
        sigmapsf: Some(0.1),
        diffmaglim: Some(20.5),
        ..Default::default()
    }
}

pub fn upper_limit(jd: f64, fid: i32) -> PrvCandidate {
    PrvCandidate {
        jd,
        fid,
        magpsf: None,
        diffmaglim: Some(20.5),
        ..Default::default()
    }
}

pub fn alert(object_id: &str, candid: i64, history: Vec<PrvCandidate>) -> ConsumedAlert {
    ConsumedAlert {
        topic: TOPIC.to_string(),
        key: "3.3".to_string(),
        alert: Alert {
            object_id: object_id.to_string(),
            candid,
            candidate: Candidate {
                jd: 2_460_100.75,
                fid: 1,
                ra: 150.123456,
                dec: -20.5,
                magpsf: 18.3,
                sigmapsf: 0.08,
                diffmaglim: Some(20.6),
                ..Default::default()
            },
            prv_candidates: Some(history),
            rf_kn_vs_nonkn: Some(0.9),
            snn_sn_vs_all: Some(0.1),
            ..Default::default()
        },
    }
}

pub fn five_finite_points() -> Vec<PrvCandidate> {
    (0..5)
        .map(|i| detection(2_460_095.5 + i as f64, 1 + (i % 2), 19.0 - 0.1 * i as f64))
        .collect()
}

pub struct Harness {
    pub notifier: Arc<RecordingNotifier>,
    pub processor: AlertProcessor,
    pub paths: ListenerPaths,
}

pub fn harness(
    base: &Path,
    history: Arc<dyn HistorySource>,
    notifier: RecordingNotifier,
    recipients: &[&str],
    sites: Vec<ObservingSite>,
) -> Harness {
    let notifier = Arc::new(notifier);
    let shared: Arc<dyn Notifier> = notifier.clone();
    let paths = ListenerPaths::new(base);
    let fanout = NotificationFanout::new(
        shared.clone(),
        OperatorChannel::new(shared, vec![OPERATOR.to_string()]),
    );
    let recipients = StaticRecipients(RecipientSet::new(
        recipients.iter().map(|r| r.to_string()).collect(),
    ));
    let processor = AlertProcessor::new(
        paths.clone(),
        LightcurveEnricher::new(history, AppendPolicy::Skip),
        Arc::new(recipients),
        fanout,
    )
    .with_sites(sites);
    Harness {
        notifier,
        processor,
        paths,
    }
}

pub fn files_under(dir: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return out;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            out.extend(files_under(&path));
        } else {
            out.push(path);
        }
    }
    out.sort();
    out
}
