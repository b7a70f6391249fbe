//! One alert, start to finish: archive, enrich, render, notify.

use std::path::PathBuf;
use std::sync::Arc;
use time::OffsetDateTime;

use crate::alert::{ConsumedAlert, NewAlert};
use crate::archive::AlertArchive;
use crate::enrich::{Enrichment, LightcurveEnricher, LightcurveView};
use crate::error::{BrokerQueryError, ListenerError, RenderError};
use crate::notify::{FanoutReport, NotificationBatch, NotificationFanout, RecipientDirectory};
use crate::paths::{ArtifactKind, ArtifactPathAllocator, DayStamp, ListenerPaths, sanitize_stem};
use crate::render::{
    LightcurveRenderer, ObservingChartRenderer, SvgLightcurveRenderer, SvgObservingChartRenderer,
};
use crate::sky::{ObservingSite, ObservingTarget, SkyPosition, jd_to_iso};
use crate::stamps::{FitsStampDecoder, PostageStampSet, StampDecoder};

#[derive(Debug)]
pub enum ProcessOutcome {
    Notified {
        artifacts: Vec<PathBuf>,
        report: FanoutReport,
    },
    /// Archived, but the alert carried no prior candidates.
    SkippedNoHistory,
    /// Archived, but the remote history query failed.
    SkippedQueryError(BrokerQueryError),
    /// Archived, but an artifact could not be rendered. Nothing was sent.
    SkippedRenderError(RenderError),
}

pub struct AlertProcessor {
    paths: ListenerPaths,
    archive: AlertArchive,
    allocator: ArtifactPathAllocator,
    enricher: LightcurveEnricher,
    stamp_decoder: Arc<dyn StampDecoder>,
    lightcurve_renderer: Arc<dyn LightcurveRenderer>,
    chart_renderer: Arc<dyn ObservingChartRenderer>,
    sites: Vec<ObservingSite>,
    recipients: Arc<dyn RecipientDirectory>,
    fanout: NotificationFanout,
}

impl AlertProcessor {
    pub fn new(
        paths: ListenerPaths,
        enricher: LightcurveEnricher,
        recipients: Arc<dyn RecipientDirectory>,
        fanout: NotificationFanout,
    ) -> Self {
        Self {
            archive: AlertArchive::new(paths.alert_db()),
            allocator: ArtifactPathAllocator::new(paths.clone()),
            paths,
            enricher,
            stamp_decoder: Arc::new(FitsStampDecoder),
            lightcurve_renderer: Arc::new(SvgLightcurveRenderer),
            chart_renderer: Arc::new(SvgObservingChartRenderer),
            sites: Vec::new(),
            recipients,
            fanout,
        }
    }

    pub fn with_sites(mut self, sites: Vec<ObservingSite>) -> Self {
        self.sites = sites;
        self
    }

    pub fn with_stamp_decoder(mut self, decoder: Arc<dyn StampDecoder>) -> Self {
        self.stamp_decoder = decoder;
        self
    }

    pub fn with_renderers(
        mut self,
        lightcurve: Arc<dyn LightcurveRenderer>,
        chart: Arc<dyn ObservingChartRenderer>,
    ) -> Self {
        self.lightcurve_renderer = lightcurve;
        self.chart_renderer = chart;
        self
    }

    pub fn archive(&self) -> &AlertArchive {
        &self.archive
    }

    pub fn fanout(&self) -> &NotificationFanout {
        &self.fanout
    }

    /// Processes one alert. `now` fixes the artifact day partition and the
    /// start of the observing charts.
    ///
    /// The raw alert is archived before anything else so it survives any later
    /// failure. Skips are outcomes, not errors; an `Err` means something the
    /// loop cannot recover from.
    #[tracing::instrument(
        skip_all,
        fields(object_id = %consumed.alert.object_id, topic = %consumed.topic)
    )]
    pub async fn process(
        &self,
        consumed: &ConsumedAlert,
        now: OffsetDateTime,
    ) -> Result<ProcessOutcome, ListenerError> {
        let alert = &consumed.alert;
        self.archive.store(alert)?;

        let new_alert = NewAlert::from(alert);
        let view = match self.enricher.enrich(&new_alert, alert.history()).await {
            Ok(Enrichment::Lightcurve(view)) => view,
            Ok(Enrichment::NoHistory) => {
                tracing::info!(
                    name = "processor.skip.no_history",
                    target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
                    object_id = %new_alert.object_id,
                    message = "No prior candidates, skipping notification"
                );
                return Ok(ProcessOutcome::SkippedNoHistory);
            }
            Err(e) => {
                tracing::error!(
                    name = "processor.skip.query_error",
                    target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
                    object_id = %new_alert.object_id,
                    error = %e,
                    likely_timeout = e.is_likely_timeout(),
                    message = "History query failed, skipping alert"
                );
                return Ok(ProcessOutcome::SkippedQueryError(e));
            }
        };

        let stamps = PostageStampSet::decode(alert, self.stamp_decoder.as_ref());
        let day = DayStamp::from_datetime(now);
        let mut artifacts = Vec::with_capacity(1 + self.sites.len());

        let lc_stem = sanitize_stem(&new_alert.object_id);
        let lc_path = self.allocate(ArtifactKind::Lightcurve, &day, &lc_stem)?;
        if let Err(e) = self
            .lightcurve_renderer
            .render(&view, &new_alert, &stamps, &lc_path)
        {
            return Ok(render_skipped(&new_alert.object_id, e));
        }
        tracing::info!(
            path = %self.paths.display_path(&lc_path).display(),
            "saved light curve"
        );
        artifacts.push(lc_path);

        let target = ObservingTarget {
            object_id: new_alert.object_id.clone(),
            position: SkyPosition {
                ra: new_alert.ra,
                dec: new_alert.dec,
            },
            sites: self.sites.clone(),
        };
        for site in &target.sites {
            let stem = sanitize_stem(&format!("{}_{}", target.object_id, site.label()));
            let oc_path = self.allocate(ArtifactKind::ObservingChart, &day, &stem)?;
            if let Err(e) = self
                .chart_renderer
                .render(target.position, site, Some(now), &oc_path)
            {
                return Ok(render_skipped(&new_alert.object_id, e));
            }
            tracing::info!(
                path = %self.paths.display_path(&oc_path).display(),
                "saved observing chart"
            );
            artifacts.push(oc_path);
        }

        let batch = NotificationBatch::new(
            compose_summary(&consumed.topic, &new_alert, &view),
            artifacts.clone(),
        );
        let recipients = self.recipients.load()?;
        let report = self.fanout.deliver(&batch, &recipients).await;

        Ok(ProcessOutcome::Notified { artifacts, report })
    }

    fn allocate(
        &self,
        kind: ArtifactKind,
        day: &DayStamp,
        stem: &str,
    ) -> Result<PathBuf, ListenerError> {
        self.allocator
            .allocate(kind, day, stem)
            .map_err(|source| ListenerError::Allocate {
                dir: self.paths.artifact_dir(kind, day),
                source,
            })
    }
}

fn render_skipped(object_id: &str, error: RenderError) -> ProcessOutcome {
    tracing::error!(
        name = "processor.skip.render_error",
        target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
        object_id = %object_id,
        error = %error,
        message = "Rendering failed, skipping alert"
    );
    ProcessOutcome::SkippedRenderError(error)
}

/// The text every subscriber receives ahead of the images.
pub fn compose_summary(topic: &str, alert: &NewAlert, view: &LightcurveView) -> String {
    let timestamp = jd_to_iso(alert.jd).unwrap_or_else(|| format!("JD {}", alert.jd));
    format!(
        "New {topic} alert!\n{timestamp}\n{}\nat ra={:.5}, dec={:.4}\nmagnitude {:.2}\n{} alerts total ({} bad/limits)",
        alert.object_id,
        alert.ra,
        alert.dec,
        alert.magpsf,
        view.len(),
        view.non_finite_count()
    )
}
