//! Typed alert records as distributed by the broker.
//!
//! Only the fields the listener reads are modelled; anything else in the
//! payload is dropped by the deserializer.

use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Measurement attached to the alert that triggered it.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Candidate {
    pub jd: f64,
    pub fid: i32,
    pub ra: f64,
    pub dec: f64,
    pub magpsf: f64,
    pub sigmapsf: f64,
    #[serde(default)]
    pub diffmaglim: Option<f64>,
    #[serde(default)]
    pub isdiffpos: Option<String>,
    #[serde(default)]
    pub candid: Option<i64>,
}

/// An earlier detection or non-detection of the same object. Magnitudes are
/// null for upper limits.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PrvCandidate {
    pub jd: f64,
    pub fid: i32,
    #[serde(default)]
    pub magpsf: Option<f64>,
    #[serde(default)]
    pub sigmapsf: Option<f64>,
    #[serde(default)]
    pub diffmaglim: Option<f64>,
    #[serde(default)]
    pub candid: Option<i64>,
    #[serde(default)]
    pub isdiffpos: Option<String>,
}

impl PrvCandidate {
    pub fn has_finite_magnitude(&self) -> bool {
        self.magpsf.is_some_and(f64::is_finite)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StampKind {
    Science,
    Template,
    Difference,
}

impl StampKind {
    pub const ALL: [StampKind; 3] = [
        StampKind::Science,
        StampKind::Template,
        StampKind::Difference,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StampKind::Science => "Science",
            StampKind::Template => "Template",
            StampKind::Difference => "Difference",
        }
    }
}

impl fmt::Display for StampKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compressed image bytes. Binary formats carry raw bytes, JSON carries base64.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct StampBlob(pub Vec<u8>);

impl fmt::Debug for StampBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StampBlob({} bytes)", self.0.len())
    }
}

impl Serialize for StampBlob {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&BASE64_STANDARD.encode(&self.0))
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

impl<'de> Deserialize<'de> for StampBlob {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct BlobVisitor;

        impl<'de> Visitor<'de> for BlobVisitor {
            type Value = StampBlob;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("bytes, a byte array or a base64 string")
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<StampBlob, E> {
                Ok(StampBlob(v.to_vec()))
            }

            fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<StampBlob, E> {
                Ok(StampBlob(v))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<StampBlob, E> {
                BASE64_STANDARD
                    .decode(v)
                    .map(StampBlob)
                    .map_err(|e| E::custom(format!("invalid base64 stamp: {e}")))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<StampBlob, A::Error> {
                let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(byte) = seq.next_element::<u8>()? {
                    out.push(byte);
                }
                Ok(StampBlob(out))
            }
        }

        deserializer.deserialize_any(BlobVisitor)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Cutout {
    #[serde(rename = "fileName", default)]
    pub file_name: Option<String>,
    #[serde(rename = "stampData", default)]
    pub stamp_data: Option<StampBlob>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Alert {
    #[serde(rename = "objectId")]
    pub object_id: String,
    pub candid: i64,
    pub candidate: Candidate,
    #[serde(default)]
    pub prv_candidates: Option<Vec<PrvCandidate>>,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub cdsxmatch: Option<String>,
    #[serde(default)]
    pub rf_snia_vs_nonia: Option<f64>,
    #[serde(default)]
    pub snn_snia_vs_nonia: Option<f64>,
    #[serde(default)]
    pub snn_sn_vs_all: Option<f64>,
    #[serde(default)]
    pub mulens: Option<f64>,
    #[serde(default)]
    pub roid: Option<i32>,
    #[serde(default)]
    pub nalerthist: Option<i32>,
    #[serde(default)]
    pub rf_kn_vs_nonkn: Option<f64>,
    #[serde(rename = "cutoutScience", default)]
    pub cutout_science: Option<Cutout>,
    #[serde(rename = "cutoutTemplate", default)]
    pub cutout_template: Option<Cutout>,
    #[serde(rename = "cutoutDifference", default)]
    pub cutout_difference: Option<Cutout>,
}

impl Alert {
    pub fn history(&self) -> &[PrvCandidate] {
        self.prv_candidates.as_deref().unwrap_or_default()
    }

    pub fn stamp(&self, kind: StampKind) -> Option<&[u8]> {
        let cutout = match kind {
            StampKind::Science => self.cutout_science.as_ref(),
            StampKind::Template => self.cutout_template.as_ref(),
            StampKind::Difference => self.cutout_difference.as_ref(),
        }?;
        cutout.stamp_data.as_ref().map(|blob| blob.0.as_slice())
    }
}

/// One delivery from the alert source.
#[derive(Clone, Debug)]
pub struct ConsumedAlert {
    pub topic: String,
    pub key: String,
    pub alert: Alert,
}

/// Flat record merging the candidate measurement with the allowlisted
/// top-level fields.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NewAlert {
    pub object_id: String,
    pub candid: i64,
    pub timestamp: Option<i64>,
    pub cdsxmatch: Option<String>,
    pub rf_snia_vs_nonia: Option<f64>,
    pub snn_snia_vs_nonia: Option<f64>,
    pub snn_sn_vs_all: Option<f64>,
    pub mulens: Option<f64>,
    pub roid: Option<i32>,
    pub nalerthist: Option<i32>,
    pub rf_kn_vs_nonkn: Option<f64>,
    pub jd: f64,
    pub fid: i32,
    pub ra: f64,
    pub dec: f64,
    pub magpsf: f64,
    pub sigmapsf: f64,
    pub diffmaglim: Option<f64>,
    pub isdiffpos: Option<String>,
}

impl From<&Alert> for NewAlert {
    fn from(alert: &Alert) -> Self {
        let c = &alert.candidate;
        Self {
            object_id: alert.object_id.clone(),
            candid: alert.candid,
            timestamp: alert.timestamp,
            cdsxmatch: alert.cdsxmatch.clone(),
            rf_snia_vs_nonia: alert.rf_snia_vs_nonia,
            snn_snia_vs_nonia: alert.snn_snia_vs_nonia,
            snn_sn_vs_all: alert.snn_sn_vs_all,
            mulens: alert.mulens,
            roid: alert.roid,
            nalerthist: alert.nalerthist,
            rf_kn_vs_nonkn: alert.rf_kn_vs_nonkn,
            jd: c.jd,
            fid: c.fid,
            ra: c.ra,
            dec: c.dec,
            magpsf: c.magpsf,
            sigmapsf: c.sigmapsf,
            diffmaglim: c.diffmaglim,
            isdiffpos: c.isdiffpos.clone(),
        }
    }
}
