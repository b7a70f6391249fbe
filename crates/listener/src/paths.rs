//! Filesystem layout and collision-free artifact naming.
//!
//! Everything lives under `<base>/alertDB/`: the raw alert archive directly,
//! and rendered artifacts in `<kind>_plots/<YYYYMMDD>/`.

use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use time::macros::format_description;

const ARTIFACT_EXTENSION: &str = "png";

#[derive(Clone, Debug)]
pub struct ListenerPaths {
    base: PathBuf,
}

impl ListenerPaths {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn alert_db(&self) -> PathBuf {
        self.base.join("alertDB")
    }

    pub fn test_mode_marker(&self) -> PathBuf {
        self.base.join("test_mode")
    }

    pub fn artifact_dir(&self, kind: ArtifactKind, day: &DayStamp) -> PathBuf {
        self.alert_db()
            .join(format!("{}_plots", kind.prefix()))
            .join(day.as_str())
    }

    /// Path relative to the base directory, for log lines.
    pub fn display_path<'a>(&self, path: &'a Path) -> &'a Path {
        path.strip_prefix(&self.base).unwrap_or(path)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArtifactKind {
    Lightcurve,
    ObservingChart,
}

impl ArtifactKind {
    pub fn prefix(self) -> &'static str {
        match self {
            ArtifactKind::Lightcurve => "lc",
            ArtifactKind::ObservingChart => "oc",
        }
    }
}

/// Day partition (`YYYYMMDD`) captured once per processing cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DayStamp(String);

impl DayStamp {
    pub fn from_datetime(now: OffsetDateTime) -> Self {
        let fmt = format_description!("[year][month][day]");
        // Formatting a calendar date with a fixed description cannot fail.
        Self(now.format(fmt).unwrap_or_default())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Hands out `<dir>/<stem>.png`, or the first free `<stem>_<n>.png`.
///
/// The returned path is free at return time only. Nothing is reserved, so
/// the caller must write it before the next allocation. Correct under the
/// single-writer model the listener runs with.
#[derive(Clone, Debug)]
pub struct ArtifactPathAllocator {
    paths: ListenerPaths,
}

impl ArtifactPathAllocator {
    pub fn new(paths: ListenerPaths) -> Self {
        Self { paths }
    }

    pub fn allocate(
        &self,
        kind: ArtifactKind,
        day: &DayStamp,
        stem: &str,
    ) -> std::io::Result<PathBuf> {
        let dir = self.paths.artifact_dir(kind, day);
        allocate_in(&dir, stem)
    }
}

pub fn allocate_in(dir: &Path, stem: &str) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let candidate = dir.join(format!("{stem}.{ARTIFACT_EXTENSION}"));
    if !candidate.exists() {
        return Ok(candidate);
    }
    let mut n: u64 = 0;
    loop {
        let candidate = dir.join(format!("{stem}_{n}.{ARTIFACT_EXTENSION}"));
        if !candidate.exists() {
            return Ok(candidate);
        }
        n += 1;
    }
}

/// Stems end up in file names; keep them to a single path component.
pub fn sanitize_stem(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            ' ' | '/' | '\\' | ':' => '_',
            other => other,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn day_stamp_is_compact_date() {
        let day = DayStamp::from_datetime(datetime!(2023-04-05 23:59:59 UTC));
        assert_eq!(day.as_str(), "20230405");
    }

    #[test]
    fn first_allocation_has_no_disambiguator() {
        let tmp = tempfile::tempdir().unwrap();
        let path = allocate_in(&tmp.path().join("a/b"), "ZTF23abc").unwrap();
        assert_eq!(path, tmp.path().join("a/b/ZTF23abc.png"));
        assert!(tmp.path().join("a/b").is_dir());
    }

    #[test]
    fn probes_in_increasing_order() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        std::fs::write(dir.join("obj.png"), b"").unwrap();
        std::fs::write(dir.join("obj_0.png"), b"").unwrap();
        std::fs::write(dir.join("obj_2.png"), b"").unwrap();
        assert_eq!(allocate_in(dir, "obj").unwrap(), dir.join("obj_1.png"));
    }

    #[test]
    fn partitions_by_kind_and_day() {
        let paths = ListenerPaths::new("/data");
        let day = DayStamp("20240101".into());
        assert_eq!(
            paths.artifact_dir(ArtifactKind::Lightcurve, &day),
            PathBuf::from("/data/alertDB/lc_plots/20240101")
        );
        assert_eq!(
            paths.artifact_dir(ArtifactKind::ObservingChart, &day),
            PathBuf::from("/data/alertDB/oc_plots/20240101")
        );
    }

    #[test]
    fn sanitize_replaces_spaces() {
        assert_eq!(sanitize_stem("La Silla Observatory"), "La_Silla_Observatory");
    }
}
