use std::fmt::Write;
use std::path::Path;
use time::{Duration, OffsetDateTime};

use super::{ObservingChartRenderer, Scale, escape_xml, raster, tick_label};
use crate::error::RenderError;
use crate::sky::{
    ObservingSite, SkyPosition, airmass, altitude, datetime_to_jd, sun_position, time_grid,
};

const WIDTH: f64 = 800.0;
const HEIGHT: f64 = 500.0;
const PLOT: (f64, f64, f64, f64) = (70.0, 60.0, 720.0, 430.0);
const GRID_POINTS: usize = 288;
const MIN_USEFUL_ALTITUDE: f64 = 30.0;
const AIRMASS_CUTOFF_ALTITUDE: f64 = 10.0;
const AIRMASS_MAX: f64 = 4.0;

#[derive(Clone, Copy, Debug, Default)]
pub struct SvgObservingChartRenderer;

impl ObservingChartRenderer for SvgObservingChartRenderer {
    fn render(
        &self,
        position: SkyPosition,
        site: &ObservingSite,
        t0: Option<OffsetDateTime>,
        out: &Path,
    ) -> Result<(), RenderError> {
        let t0 = t0.unwrap_or_else(OffsetDateTime::now_utc);
        let svg = observing_chart_svg(position, site, t0);
        raster::write_png(&svg, out)
    }
}

struct Sample {
    hours: f64,
    target_alt: f64,
    sun_alt: f64,
}

fn sample_night(position: SkyPosition, site: &ObservingSite, t0: OffsetDateTime) -> Vec<Sample> {
    time_grid(t0, Duration::hours(24), GRID_POINTS)
        .into_iter()
        .map(|t| {
            let jd = datetime_to_jd(t);
            Sample {
                hours: (t - t0).as_seconds_f64() / 3600.0,
                target_alt: altitude(position, site, jd),
                sun_alt: altitude(sun_position(jd), site, jd),
            }
        })
        .collect()
}

/// Target and sun altitude over the 24 hours from `t0`, with twilight and
/// night shaded and the target airmass on a second axis.
pub fn observing_chart_svg(
    position: SkyPosition,
    site: &ObservingSite,
    t0: OffsetDateTime,
) -> String {
    let (left, top, right, bottom) = PLOT;
    let samples = sample_night(position, site, t0);
    let x = Scale::new((0.0, 24.0), (left, right));
    let y = Scale::new((0.0, 90.0), (bottom, top));
    let am = Scale::new((1.0, AIRMASS_MAX), (top, bottom));

    let mut svg = String::new();
    let _ = writeln!(
        svg,
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{WIDTH}" height="{HEIGHT}" font-family="sans-serif">"#
    );

    let step = if samples.len() > 1 {
        samples[1].hours - samples[0].hours
    } else {
        24.0
    };
    for s in &samples {
        let fill = if s.sun_alt < -18.0 {
            "#333333"
        } else if s.sun_alt < 0.0 {
            "#808080"
        } else {
            continue;
        };
        let x0 = x.map(s.hours);
        let x1 = x.map((s.hours + step).min(24.0));
        let _ = writeln!(
            svg,
            r#"<rect class="night" x="{x0:.2}" y="{top}" width="{:.2}" height="{}" fill="{fill}" fill-opacity="0.5"/>"#,
            (x1 - x0).max(0.0),
            bottom - top
        );
    }

    let _ = writeln!(
        svg,
        r#"<rect x="{left}" y="{top}" width="{}" height="{}" fill="none" stroke="black"/>"#,
        right - left,
        bottom - top
    );
    for t in (0..=24).step_by(3) {
        let px = x.map(t as f64);
        let _ = writeln!(
            svg,
            r#"<line x1="{px:.1}" y1="{bottom}" x2="{px:.1}" y2="{}" stroke="black"/><text x="{px:.1}" y="{}" font-size="11" text-anchor="middle">{t}</text>"#,
            bottom + 5.0,
            bottom + 18.0
        );
    }
    for alt in (0..=90).step_by(15) {
        let py = y.map(alt as f64);
        let _ = writeln!(
            svg,
            r#"<line x1="{}" y1="{py:.1}" x2="{left}" y2="{py:.1}" stroke="black"/><text x="{}" y="{:.1}" font-size="11" text-anchor="end">{alt}</text>"#,
            left - 5.0,
            left - 8.0,
            py + 4.0
        );
    }
    for t in am.ticks() {
        let py = am.map(t);
        let _ = writeln!(
            svg,
            r#"<line x1="{right}" y1="{py:.1}" x2="{}" y2="{py:.1}" stroke="red"/><text x="{}" y="{:.1}" font-size="11" fill="red">{}</text>"#,
            right + 5.0,
            right + 8.0,
            py + 4.0,
            tick_label(t)
        );
    }
    let _ = writeln!(
        svg,
        r#"<text x="{:.1}" y="{}" font-size="13" text-anchor="middle">hours from {}</text>"#,
        (left + right) / 2.0,
        bottom + 38.0,
        escape_xml(&hour_label(t0))
    );
    let _ = writeln!(
        svg,
        r#"<text x="20" y="{:.1}" font-size="13" text-anchor="middle" transform="rotate(-90 20 {:.1})">altitude (deg)</text>"#,
        (top + bottom) / 2.0,
        (top + bottom) / 2.0
    );

    let clamp_alt = |a: f64| a.clamp(0.0, 90.0);
    let target_points: Vec<String> = samples
        .iter()
        .map(|s| format!("{:.1},{:.1}", x.map(s.hours), y.map(clamp_alt(s.target_alt))))
        .collect();
    let sun_points: Vec<String> = samples
        .iter()
        .map(|s| format!("{:.1},{:.1}", x.map(s.hours), y.map(clamp_alt(s.sun_alt))))
        .collect();
    let _ = writeln!(
        svg,
        r##"<polyline class="sun" points="{}" fill="none" stroke="#808080" stroke-dasharray="6 4"/>"##,
        sun_points.join(" ")
    );
    let _ = writeln!(
        svg,
        r##"<polyline class="target" points="{}" fill="none" stroke="#1f77b4" stroke-width="2"/>"##,
        target_points.join(" ")
    );

    // Airmass is only meaningful well above the horizon; split into runs.
    let mut run: Vec<String> = Vec::new();
    let mut runs: Vec<Vec<String>> = Vec::new();
    for s in &samples {
        match airmass(s.target_alt).filter(|_| s.target_alt > AIRMASS_CUTOFF_ALTITUDE) {
            Some(a) => run.push(format!(
                "{:.1},{:.1}",
                x.map(s.hours),
                am.map(a.min(AIRMASS_MAX))
            )),
            None if !run.is_empty() => runs.push(std::mem::take(&mut run)),
            None => {}
        }
    }
    if !run.is_empty() {
        runs.push(run);
    }
    for run in runs {
        let _ = writeln!(
            svg,
            r#"<polyline class="airmass" points="{}" fill="none" stroke="red"/>"#,
            run.join(" ")
        );
    }

    let _ = writeln!(
        svg,
        r#"<text x="{:.1}" y="30" font-size="15" text-anchor="middle">Observing from {}</text>"#,
        (left + right) / 2.0,
        escape_xml(&site.label())
    );
    if samples.iter().all(|s| s.target_alt <= MIN_USEFUL_ALTITUDE) {
        let _ = writeln!(
            svg,
            r#"<text class="warning" x="{:.1}" y="{:.1}" font-size="16" fill="red" text-anchor="middle">target alt never &gt;30 deg</text>"#,
            (left + right) / 2.0,
            (top + bottom) / 2.0
        );
    }

    svg.push_str("</svg>\n");
    svg
}

fn hour_label(t0: OffsetDateTime) -> String {
    let fmt = time::macros::format_description!("[year]-[month]-[day] [hour]:[minute] UTC");
    t0.format(fmt).unwrap_or_else(|_| t0.to_string())
}
