//! Image artifacts attached to notifications.
//!
//! Both renderers compose an SVG document and rasterize it to PNG.

pub mod lightcurve;
pub mod observing_chart;
pub mod raster;

use std::path::Path;
use time::OffsetDateTime;

use crate::alert::NewAlert;
use crate::enrich::LightcurveView;
use crate::error::RenderError;
use crate::sky::{ObservingSite, SkyPosition};
use crate::stamps::PostageStampSet;

pub use lightcurve::SvgLightcurveRenderer;
pub use observing_chart::SvgObservingChartRenderer;

pub trait LightcurveRenderer: Send + Sync {
    fn render(
        &self,
        view: &LightcurveView,
        alert: &NewAlert,
        stamps: &PostageStampSet,
        out: &Path,
    ) -> Result<(), RenderError>;
}

pub trait ObservingChartRenderer: Send + Sync {
    /// Renders the night from `t0` (now if `None`) as seen from `site`.
    fn render(
        &self,
        position: SkyPosition,
        site: &ObservingSite,
        t0: Option<OffsetDateTime>,
        out: &Path,
    ) -> Result<(), RenderError>;
}

/// matplotlib's default colour cycle.
pub(crate) const COLOR_CYCLE: [&str; 6] = [
    "#1f77b4", "#ff7f0e", "#2ca02c", "#d62728", "#9467bd", "#8c564b",
];

pub(crate) fn escape_xml(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

pub(crate) fn tick_label(v: f64) -> String {
    let s = format!("{v:.2}");
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

/// Linear map from a data interval onto a pixel interval.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Scale {
    d0: f64,
    d1: f64,
    p0: f64,
    p1: f64,
}

impl Scale {
    pub(crate) fn new(domain: (f64, f64), pixels: (f64, f64)) -> Self {
        let (d0, mut d1) = domain;
        if (d1 - d0).abs() < f64::EPSILON {
            d1 = d0 + 1.0;
        }
        Self {
            d0,
            d1,
            p0: pixels.0,
            p1: pixels.1,
        }
    }

    pub(crate) fn map(&self, v: f64) -> f64 {
        self.p0 + (v - self.d0) / (self.d1 - self.d0) * (self.p1 - self.p0)
    }

    /// Roughly five evenly spaced tick values inside the domain.
    pub(crate) fn ticks(&self) -> Vec<f64> {
        let (lo, hi) = if self.d0 <= self.d1 {
            (self.d0, self.d1)
        } else {
            (self.d1, self.d0)
        };
        let raw_step = (hi - lo) / 5.0;
        let magnitude = 10f64.powf(raw_step.log10().floor());
        let step = [1.0, 2.0, 5.0, 10.0]
            .iter()
            .map(|m| m * magnitude)
            .find(|s| *s >= raw_step)
            .unwrap_or(raw_step);
        let mut v = (lo / step).ceil() * step;
        let mut ticks = Vec::new();
        while v <= hi + step * 1e-9 {
            ticks.push(v);
            v += step;
        }
        ticks
    }
}
