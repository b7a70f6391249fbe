//! Low-precision positional astronomy: enough to plan a night, not to point
//! a telescope. Angles are degrees unless the name says otherwise.

use time::{Duration, OffsetDateTime};

use crate::config::SiteConfig;

/// Julian date of the Unix epoch.
pub const UNIX_EPOCH_JD: f64 = 2_440_587.5;
const J2000_JD: f64 = 2_451_545.0;
const SECONDS_PER_DAY: f64 = 86_400.0;

pub fn jd_to_datetime(jd: f64) -> Option<OffsetDateTime> {
    if !jd.is_finite() {
        return None;
    }
    let nanos = ((jd - UNIX_EPOCH_JD) * SECONDS_PER_DAY * 1e9).round() as i128;
    OffsetDateTime::from_unix_timestamp_nanos(nanos).ok()
}

pub fn datetime_to_jd(t: OffsetDateTime) -> f64 {
    UNIX_EPOCH_JD + t.unix_timestamp_nanos() as f64 / 1e9 / SECONDS_PER_DAY
}

/// `YYYY-MM-DD HH:MM:SS.sss`, the ISO-like form used in notifications.
pub fn jd_to_iso(jd: f64) -> Option<String> {
    let fmt = time::macros::format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]"
    );
    jd_to_datetime(jd)?.format(fmt).ok()
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SkyPosition {
    pub ra: f64,
    pub dec: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ObservingSite {
    pub name: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub height_m: f64,
}

impl From<&SiteConfig> for ObservingSite {
    fn from(cfg: &SiteConfig) -> Self {
        Self {
            name: cfg.name.clone(),
            latitude: cfg.latitude_deg,
            longitude: cfg.longitude_deg,
            height_m: cfg.height_m,
        }
    }
}

impl ObservingSite {
    /// Site name, or its coordinates in signed degrees/minutes/seconds.
    pub fn label(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        let (lat, lat_card) = (dms(self.latitude), if self.latitude < 0.0 { 'S' } else { 'N' });
        let (lon, lon_card) = (dms(self.longitude), if self.longitude < 0.0 { 'W' } else { 'E' });
        format!("{lat} {lat_card} {lon} {lon_card}")
    }
}

fn dms(angle: f64) -> String {
    let a = angle.abs();
    let d = a.trunc();
    let m = ((a - d) * 60.0).trunc();
    let s = ((a - d) * 60.0 - m) * 60.0;
    format!("{} {} {}", d as i64, m as i64, s.round() as i64)
}

/// A target to plan follow-up for, with the sites it may be observed from.
#[derive(Clone, Debug, PartialEq)]
pub struct ObservingTarget {
    pub object_id: String,
    pub position: SkyPosition,
    pub sites: Vec<ObservingSite>,
}

/// Greenwich mean sidereal time.
pub fn gmst(jd: f64) -> f64 {
    (280.460_618_37 + 360.985_647_366_29 * (jd - J2000_JD)).rem_euclid(360.0)
}

/// Altitude above the horizon of `pos` seen from `site` at `jd`.
pub fn altitude(pos: SkyPosition, site: &ObservingSite, jd: f64) -> f64 {
    let lst = gmst(jd) + site.longitude;
    let hour_angle = (lst - pos.ra).to_radians();
    let (dec, lat) = (pos.dec.to_radians(), site.latitude.to_radians());
    let sin_alt = dec.sin() * lat.sin() + dec.cos() * lat.cos() * hour_angle.cos();
    sin_alt.clamp(-1.0, 1.0).asin().to_degrees()
}

/// Plane-parallel airmass, `None` at or below the horizon.
pub fn airmass(altitude_deg: f64) -> Option<f64> {
    (altitude_deg > 0.0).then(|| 1.0 / (90.0 - altitude_deg).to_radians().cos())
}

/// Apparent solar position, accurate to about a hundredth of a degree.
pub fn sun_position(jd: f64) -> SkyPosition {
    let n = jd - J2000_JD;
    let mean_longitude = (280.460 + 0.985_647_4 * n).rem_euclid(360.0);
    let mean_anomaly = (357.528 + 0.985_600_3 * n).rem_euclid(360.0).to_radians();
    let ecliptic_longitude = (mean_longitude
        + 1.915 * mean_anomaly.sin()
        + 0.020 * (2.0 * mean_anomaly).sin())
    .to_radians();
    let obliquity = (23.439 - 0.000_000_4 * n).to_radians();
    let ra = (obliquity.cos() * ecliptic_longitude.sin())
        .atan2(ecliptic_longitude.cos())
        .to_degrees()
        .rem_euclid(360.0);
    let dec = (obliquity.sin() * ecliptic_longitude.sin()).asin().to_degrees();
    SkyPosition { ra, dec }
}

/// Evenly spaced instants covering `span` from `start`.
pub fn time_grid(start: OffsetDateTime, span: Duration, steps: usize) -> Vec<OffsetDateTime> {
    if steps < 2 {
        return vec![start];
    }
    let step = span / (steps as f64 - 1.0);
    (0..steps).map(|i| start + step * i as f64).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn jd_round_trips_unix_epoch() {
        let t = jd_to_datetime(UNIX_EPOCH_JD).unwrap();
        assert_eq!(t.unix_timestamp(), 0);
        assert!((datetime_to_jd(t) - UNIX_EPOCH_JD).abs() < 1e-9);
    }

    #[test]
    fn iso_format_has_millis() {
        assert_eq!(
            jd_to_iso(J2000_JD).as_deref(),
            Some("2000-01-01 12:00:00.000")
        );
        assert_eq!(jd_to_iso(f64::NAN), None);
    }

    #[test]
    fn sun_is_near_equinox_position() {
        let jd = datetime_to_jd(datetime!(2024-03-20 03:06 UTC));
        let sun = sun_position(jd);
        assert!(sun.dec.abs() < 0.1, "dec = {}", sun.dec);
    }

    #[test]
    fn zenith_object_has_unit_airmass() {
        let site = ObservingSite {
            name: None,
            latitude: -30.0,
            longitude: 0.0,
            height_m: 0.0,
        };
        let jd = 2_460_000.0;
        let pos = SkyPosition {
            ra: gmst(jd),
            dec: -30.0,
        };
        let alt = altitude(pos, &site, jd);
        assert!((alt - 90.0).abs() < 1e-6);
        assert!((airmass(alt).unwrap() - 1.0).abs() < 1e-6);
        assert_eq!(airmass(-5.0), None);
    }

    #[test]
    fn unnamed_site_label_uses_coordinates() {
        let site = ObservingSite {
            name: None,
            latitude: -29.5,
            longitude: -70.75,
            height_m: 0.0,
        };
        assert_eq!(site.label(), "29 30 0 S 70 45 0 W");
    }

    #[test]
    fn grid_spans_requested_interval() {
        let start = datetime!(2024-01-01 00:00 UTC);
        let grid = time_grid(start, Duration::hours(24), 289);
        assert_eq!(grid.len(), 289);
        assert_eq!(grid[288] - grid[0], Duration::hours(24));
    }
}
