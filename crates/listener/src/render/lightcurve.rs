use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::path::Path;

use super::{COLOR_CYCLE, LightcurveRenderer, Scale, escape_xml, raster, tick_label};
use crate::alert::{NewAlert, StampKind};
use crate::enrich::{LightcurveRow, LightcurveView};
use crate::error::RenderError;
use crate::stamps::{PostageStampSet, StampImage};

const WIDTH: f64 = 800.0;
const HEIGHT: f64 = 600.0;
const PLOT: (f64, f64, f64, f64) = (70.0, 80.0, 570.0, 540.0);
const STAMP_X: f64 = 610.0;
const STAMP_SIZE: f64 = 150.0;
const STAMP_GAP: f64 = 12.0;

pub fn filter_name(fid: i32) -> Option<&'static str> {
    match fid {
        1 => Some("g"),
        2 => Some("r"),
        3 => Some("i"),
        _ => None,
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SvgLightcurveRenderer;

impl LightcurveRenderer for SvgLightcurveRenderer {
    fn render(
        &self,
        view: &LightcurveView,
        alert: &NewAlert,
        stamps: &PostageStampSet,
        out: &Path,
    ) -> Result<(), RenderError> {
        let svg = lightcurve_svg(view, alert, stamps)?;
        raster::write_png(&svg, out)
    }
}

/// Composes the light-curve figure: detections with error bars per filter,
/// hollow triangles at the limiting magnitude for non-detections, and the
/// three postage stamps in a column on the right.
pub fn lightcurve_svg(
    view: &LightcurveView,
    alert: &NewAlert,
    stamps: &PostageStampSet,
) -> Result<String, RenderError> {
    let (left, top, right, bottom) = PLOT;
    let mut svg = String::new();
    let _ = writeln!(
        svg,
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{WIDTH}" height="{HEIGHT}" font-family="sans-serif">"#
    );

    let jd_first = view
        .rows()
        .iter()
        .map(|r| r.jd)
        .fold(f64::INFINITY, f64::min);
    let jd_last = view
        .rows()
        .iter()
        .map(|r| r.jd)
        .fold(f64::NEG_INFINITY, f64::max);
    let (mag_lo, mag_hi) = magnitude_range(view.rows());

    let x = Scale::new((0.0, (jd_last - jd_first).max(1.0) * 1.05), (left, right));
    // Bright at the top.
    let y = Scale::new((mag_lo, mag_hi), (top, bottom));

    let _ = writeln!(
        svg,
        r#"<rect x="{left}" y="{top}" width="{}" height="{}" fill="none" stroke="black"/>"#,
        right - left,
        bottom - top
    );
    for t in x.ticks() {
        let px = x.map(t);
        let _ = writeln!(
            svg,
            r#"<line x1="{px:.1}" y1="{bottom}" x2="{px:.1}" y2="{}" stroke="black"/><text x="{px:.1}" y="{}" font-size="11" text-anchor="middle">{}</text>"#,
            bottom + 5.0,
            bottom + 18.0,
            tick_label(t)
        );
    }
    for t in y.ticks() {
        let py = y.map(t);
        let _ = writeln!(
            svg,
            r#"<line x1="{}" y1="{py:.1}" x2="{left}" y2="{py:.1}" stroke="black"/><text x="{}" y="{:.1}" font-size="11" text-anchor="end">{}</text>"#,
            left - 5.0,
            left - 8.0,
            py + 4.0,
            tick_label(t)
        );
    }
    let _ = writeln!(
        svg,
        r#"<text x="{:.1}" y="{}" font-size="13" text-anchor="middle">days since first alert</text>"#,
        (left + right) / 2.0,
        bottom + 38.0
    );

    let mut by_filter: BTreeMap<i32, Vec<&LightcurveRow>> = BTreeMap::new();
    for row in view.rows() {
        by_filter.entry(row.fid).or_default().push(row);
    }

    for (ii, (fid, rows)) in by_filter.iter().enumerate() {
        let color = COLOR_CYCLE[ii % COLOR_CYCLE.len()];
        for row in rows {
            let px = x.map(row.jd - jd_first);
            match (row.is_finite(), row.magpsf, row.diffmaglim) {
                (true, Some(mag), _) => {
                    let py = y.map(mag);
                    if let Some(err) = row.sigmapsf.filter(|e| e.is_finite()) {
                        let _ = writeln!(
                            svg,
                            r#"<line x1="{px:.1}" y1="{:.1}" x2="{px:.1}" y2="{:.1}" stroke="{color}"/>"#,
                            y.map(mag - err),
                            y.map(mag + err)
                        );
                    }
                    let _ = writeln!(
                        svg,
                        r#"<circle class="detection" cx="{px:.1}" cy="{py:.1}" r="4" fill="{color}"/>"#
                    );
                }
                (_, _, Some(limit)) if limit.is_finite() => {
                    let py = y.map(limit);
                    let _ = writeln!(
                        svg,
                        r#"<polygon class="limit" points="{:.1},{:.1} {:.1},{:.1} {px:.1},{:.1}" fill="none" stroke="{color}"/>"#,
                        px - 5.0,
                        py - 4.0,
                        px + 5.0,
                        py - 4.0,
                        py + 5.0
                    );
                }
                _ => {}
            }
        }
        if let Some(name) = filter_name(*fid) {
            let ly = top + 18.0 + 18.0 * ii as f64;
            let _ = writeln!(
                svg,
                r#"<circle cx="{:.1}" cy="{ly:.1}" r="4" fill="{color}"/><text x="{:.1}" y="{:.1}" font-size="12" font-style="italic">{name}</text>"#,
                right - 40.0,
                right - 30.0,
                ly + 4.0
            );
        }
    }

    let info = format!(
        "kn_prob:{} sn_prob:{}",
        fmt_prob(alert.rf_kn_vs_nonkn),
        fmt_prob(alert.snn_sn_vs_all)
    );
    let _ = writeln!(
        svg,
        r#"<text x="{:.1}" y="{:.1}" font-size="15" text-anchor="middle">{}</text><text x="{:.1}" y="{:.1}" font-size="12" text-anchor="middle">{}</text>"#,
        (left + right) / 2.0,
        top - 36.0,
        escape_xml(&alert.object_id),
        (left + right) / 2.0,
        top - 16.0,
        escape_xml(&info)
    );

    for (i, kind) in StampKind::ALL.iter().enumerate() {
        let sy = top + i as f64 * (STAMP_SIZE + STAMP_GAP);
        let _ = writeln!(
            svg,
            r#"<rect x="{STAMP_X}" y="{sy}" width="{STAMP_SIZE}" height="{STAMP_SIZE}" fill="none" stroke="black"/><text x="{:.1}" y="{:.1}" font-size="12" transform="rotate(90 {:.1} {:.1})" text-anchor="middle">{kind}</text>"#,
            STAMP_X + STAMP_SIZE + 8.0,
            sy + STAMP_SIZE / 2.0,
            STAMP_X + STAMP_SIZE + 8.0,
            sy + STAMP_SIZE / 2.0
        );
        let Some(image) = stamps.get(*kind) else {
            continue;
        };
        let uri = match stamp_data_uri(image) {
            Ok(uri) => uri,
            Err(e) => {
                tracing::warn!(
                    name = "render.stamp.dropped",
                    target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
                    object_id = %alert.object_id,
                    kind = %kind,
                    error = %e,
                    message = "Leaving stamp panel empty"
                );
                continue;
            }
        };
        let _ = writeln!(
            svg,
            r#"<image class="stamp" x="{STAMP_X}" y="{sy}" width="{STAMP_SIZE}" height="{STAMP_SIZE}" preserveAspectRatio="none" href="{uri}"/>"#
        );
        let cx = STAMP_X + 0.5 * STAMP_SIZE;
        let cy = sy + 0.5 * STAMP_SIZE;
        let _ = writeln!(
            svg,
            r#"<line x1="{cx:.1}" y1="{:.1}" x2="{cx:.1}" y2="{:.1}" stroke="red"/><line x1="{:.1}" y1="{cy:.1}" x2="{:.1}" y2="{cy:.1}" stroke="red"/>"#,
            sy + 0.2 * STAMP_SIZE,
            sy + 0.4 * STAMP_SIZE,
            STAMP_X + 0.2 * STAMP_SIZE,
            STAMP_X + 0.4 * STAMP_SIZE
        );
    }

    svg.push_str("</svg>\n");
    Ok(svg)
}

fn fmt_prob(p: Option<f64>) -> String {
    p.map(|v| format!("{v:.2}")).unwrap_or_else(|| "nan".to_string())
}

fn magnitude_range(rows: &[LightcurveRow]) -> (f64, f64) {
    let mut lo = f64::INFINITY;
    let mut hi = f64::NEG_INFINITY;
    for row in rows {
        if row.is_finite() {
            let mag = row.magpsf.unwrap_or_default();
            let err = row.sigmapsf.filter(|e| e.is_finite()).unwrap_or(0.0);
            lo = lo.min(mag - err);
            hi = hi.max(mag + err);
        } else if let Some(limit) = row.diffmaglim.filter(|l| l.is_finite()) {
            lo = lo.min(limit);
            hi = hi.max(limit);
        }
    }
    if !lo.is_finite() || !hi.is_finite() {
        return (17.0, 22.0);
    }
    (lo - 0.2, hi + 0.2)
}

/// Display range clipping the faintest and brightest outliers, in the spirit
/// of a z-scale interval.
pub fn display_limits(image: &StampImage) -> Option<(f64, f64)> {
    let mut values: Vec<f64> = image.finite_values().collect();
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let at = |q: f64| values[((values.len() - 1) as f64 * q).round() as usize];
    let (lo, hi) = (at(0.01), at(0.995));
    Some(if hi > lo { (lo, hi) } else { (lo, lo + 1.0) })
}

fn stamp_data_uri(image: &StampImage) -> Result<String, RenderError> {
    let (lo, hi) = display_limits(image).unwrap_or((0.0, 1.0));
    let pixels: Vec<u8> = image
        .data
        .iter()
        .map(|v| {
            if v.is_finite() {
                (((v - lo) / (hi - lo)).clamp(0.0, 1.0) * 255.0).round() as u8
            } else {
                0
            }
        })
        .collect();
    let gray = image::GrayImage::from_raw(image.width as u32, image.height as u32, pixels)
        .ok_or_else(|| RenderError::Encode("stamp dimensions do not match data".into()))?;
    let mut png = Vec::new();
    image::DynamicImage::ImageLuma8(gray)
        .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
        .map_err(|e| RenderError::Encode(e.to_string()))?;
    Ok(format!("data:image/png;base64,{}", BASE64_STANDARD.encode(png)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::{Alert, Candidate, PrvCandidate};

    fn new_alert() -> NewAlert {
        NewAlert::from(&Alert {
            object_id: "ZTF23aaaaaaa".into(),
            candidate: Candidate {
                jd: 2460003.0,
                fid: 1,
                magpsf: 18.0,
                sigmapsf: 0.05,
                ..Default::default()
            },
            rf_kn_vs_nonkn: Some(0.8123),
            ..Default::default()
        })
    }

    fn history() -> Vec<PrvCandidate> {
        vec![
            PrvCandidate {
                jd: 2460000.0,
                fid: 1,
                magpsf: Some(18.5),
                sigmapsf: Some(0.1),
                ..Default::default()
            },
            PrvCandidate {
                jd: 2460001.0,
                fid: 2,
                magpsf: Some(18.7),
                sigmapsf: Some(0.1),
                ..Default::default()
            },
            PrvCandidate {
                jd: 2460002.0,
                fid: 2,
                magpsf: None,
                diffmaglim: Some(20.3),
                ..Default::default()
            },
        ]
    }

    #[test]
    fn draws_detections_and_limits() {
        let view = LightcurveView::from_embedded("ZTF23aaaaaaa", &history());
        let svg = lightcurve_svg(&view, &new_alert(), &PostageStampSet::default()).unwrap();
        assert_eq!(svg.matches(r#"class="detection""#).count(), 2);
        assert_eq!(svg.matches(r#"class="limit""#).count(), 1);
        assert!(svg.contains("kn_prob:0.81 sn_prob:nan"));
        assert!(!svg.contains(r#"class="stamp""#));
    }

    #[test]
    fn display_limits_ignore_nan() {
        let image = StampImage {
            width: 2,
            height: 2,
            data: vec![f64::NAN, 1.0, 2.0, 3.0],
        };
        let (lo, hi) = display_limits(&image).unwrap();
        assert!(lo >= 1.0 && hi <= 3.0 && hi > lo);
    }

    #[test]
    fn renders_png_with_stamp() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("lc.png");
        let blob = crate::stamps::tests::fits_f32(4, 4, &[1.0; 16]);
        let alert = Alert {
            object_id: "ZTF23aaaaaaa".into(),
            cutout_science: Some(crate::alert::Cutout {
                file_name: None,
                stamp_data: Some(crate::alert::StampBlob(blob)),
            }),
            ..Default::default()
        };
        let stamps = PostageStampSet::decode(&alert, &crate::stamps::FitsStampDecoder);
        assert_eq!(stamps.len(), 1);
        let view = LightcurveView::from_embedded("ZTF23aaaaaaa", &history());
        SvgLightcurveRenderer
            .render(&view, &new_alert(), &stamps, &out)
            .unwrap();
        assert!(std::fs::metadata(&out).unwrap().len() > 0);
    }

    #[test]
    fn malformed_stamps_still_render() {
        let view = LightcurveView::from_embedded("ZTF23aaaaaaa", &history());
        for (case, blob) in crate::stamps::tests::malformed_stamps() {
            let alert = crate::stamps::tests::alert_with_science(blob);
            let stamps = PostageStampSet::decode(&alert, &crate::stamps::FitsStampDecoder);
            let svg = lightcurve_svg(&view, &new_alert(), &stamps).unwrap();
            assert_eq!(svg.matches(r#"class="stamp""#).count(), 2, "{case}");
            raster::svg_to_png(&svg).unwrap();
        }
    }

    #[test]
    fn unencodable_stamp_leaves_panel_empty() {
        let mut stamps = PostageStampSet::default();
        stamps.insert(
            StampKind::Science,
            StampImage {
                width: 0,
                height: 0,
                data: vec![],
            },
        );
        let view = LightcurveView::from_embedded("ZTF23aaaaaaa", &history());
        let svg = lightcurve_svg(&view, &new_alert(), &stamps).unwrap();
        assert!(!svg.contains(r#"class="stamp""#));
    }
}
