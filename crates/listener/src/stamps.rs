//! Postage-stamp decoding: gzip-compressed single-HDU FITS images.

use flate2::read::GzDecoder;
use std::collections::BTreeMap;
use std::io::Read;

use crate::alert::{Alert, StampKind};
use crate::error::StampDecodeError;

const FITS_BLOCK: usize = 2880;
const FITS_CARD: usize = 80;
/// Largest accepted image side. Broker stamps are 63x63.
pub const MAX_STAMP_SIDE: usize = 4096;
const MAX_HEADER_BLOCKS: usize = 36;
const MAX_DECOMPRESSED: u64 =
    (MAX_HEADER_BLOCKS * FITS_BLOCK + MAX_STAMP_SIDE * MAX_STAMP_SIDE * 8) as u64;

/// A decoded 2-D image in row-major order (`height` rows of `width` pixels).
#[derive(Clone, Debug, PartialEq)]
pub struct StampImage {
    pub width: usize,
    pub height: usize,
    pub data: Vec<f64>,
}

impl StampImage {
    /// Builds an image from row-major rows, as returned by the broker's
    /// cutout endpoint.
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Result<Self, StampDecodeError> {
        let height = rows.len();
        let width = rows.first().map(Vec::len).unwrap_or(0);
        check_dimensions(width, height)?;
        if rows.iter().any(|row| row.len() != width) {
            return Err(StampDecodeError::Header("ragged cutout rows".into()));
        }
        Ok(Self {
            width,
            height,
            data: rows.into_iter().flatten().collect(),
        })
    }

    pub fn get(&self, x: usize, y: usize) -> Option<f64> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.data.get(y * self.width + x).copied()
    }

    pub fn finite_values(&self) -> impl Iterator<Item = f64> + '_ {
        self.data.iter().copied().filter(|v| v.is_finite())
    }
}

pub trait StampDecoder: Send + Sync {
    fn decode(&self, blob: &[u8]) -> Result<StampImage, StampDecodeError>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FitsStampDecoder;

impl StampDecoder for FitsStampDecoder {
    fn decode(&self, blob: &[u8]) -> Result<StampImage, StampDecodeError> {
        if blob.is_empty() {
            return Err(StampDecodeError::Empty);
        }
        parse_fits_primary(&inflate(blob, MAX_DECOMPRESSED)?)
    }
}

fn inflate(blob: &[u8], limit: u64) -> Result<Vec<u8>, StampDecodeError> {
    let mut raw = Vec::new();
    GzDecoder::new(blob).take(limit + 1).read_to_end(&mut raw)?;
    if raw.len() as u64 > limit {
        return Err(StampDecodeError::TooLarge(limit));
    }
    Ok(raw)
}

/// Decoded stamps per kind. Kinds that were missing or failed to decode are
/// absent.
#[derive(Clone, Debug, Default)]
pub struct PostageStampSet {
    images: BTreeMap<StampKind, StampImage>,
}

impl PostageStampSet {
    pub fn decode(alert: &Alert, decoder: &dyn StampDecoder) -> Self {
        let mut images = BTreeMap::new();
        for kind in StampKind::ALL {
            let Some(blob) = alert.stamp(kind) else {
                tracing::warn!(object_id = %alert.object_id, kind = %kind, "postage stamp is none");
                continue;
            };
            match decoder.decode(blob) {
                Ok(image) => {
                    images.insert(kind, image);
                }
                Err(e) => {
                    tracing::warn!(
                        name = "stamps.decode.failed",
                        target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
                        object_id = %alert.object_id,
                        kind = %kind,
                        error = %e,
                        message = "Failed to decode postage stamp"
                    );
                }
            }
        }
        Self { images }
    }

    pub fn get(&self, kind: StampKind) -> Option<&StampImage> {
        self.images.get(&kind)
    }

    pub fn insert(&mut self, kind: StampKind, image: StampImage) {
        self.images.insert(kind, image);
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

struct FitsHeader {
    bitpix: i64,
    axes: Vec<usize>,
    bscale: f64,
    bzero: f64,
    data_offset: usize,
}

fn parse_header(raw: &[u8]) -> Result<FitsHeader, StampDecodeError> {
    let mut cards: BTreeMap<String, String> = BTreeMap::new();
    let mut offset = 0;
    let mut ended = false;
    while !ended {
        if offset >= MAX_HEADER_BLOCKS * FITS_BLOCK {
            return Err(StampDecodeError::Header("no END card".into()));
        }
        let block = raw
            .get(offset..offset + FITS_BLOCK)
            .ok_or_else(|| StampDecodeError::Header("no END card".into()))?;
        for card in block.chunks(FITS_CARD) {
            if !card.is_ascii() {
                return Err(StampDecodeError::Header("non-ASCII header card".into()));
            }
            // ASCII, so every byte offset below is a char boundary.
            let card = std::str::from_utf8(card)
                .map_err(|_| StampDecodeError::Header("non-ASCII header card".into()))?;
            let keyword = card[..8.min(card.len())].trim_end();
            if keyword == "END" {
                ended = true;
                break;
            }
            if card.len() > 10 && &card[8..10] == "= " {
                let value = card[10..].split('/').next().unwrap_or("").trim();
                cards.insert(keyword.to_string(), value.trim_matches('\'').trim().to_string());
            }
        }
        offset += FITS_BLOCK;
    }

    let int = |key: &str| -> Result<i64, StampDecodeError> {
        cards
            .get(key)
            .ok_or_else(|| StampDecodeError::Header(format!("missing {key}")))?
            .parse::<i64>()
            .map_err(|_| StampDecodeError::Header(format!("{key} is not an integer")))
    };
    let float_or = |key: &str, default: f64| -> f64 {
        cards
            .get(key)
            .and_then(|v| v.replace('D', "E").parse().ok())
            .unwrap_or(default)
    };

    let bitpix = int("BITPIX")?;
    let naxis = int("NAXIS")?;
    if naxis != 2 {
        return Err(StampDecodeError::Header(format!(
            "expected a 2-D image, NAXIS = {naxis}"
        )));
    }
    let axes = (1..=naxis)
        .map(|i| {
            let key = format!("NAXIS{i}");
            let n = int(&key)?;
            usize::try_from(n)
                .map_err(|_| StampDecodeError::Header(format!("{key} = {n} is negative")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    check_dimensions(axes[0], axes[1])?;

    Ok(FitsHeader {
        bitpix,
        axes,
        bscale: float_or("BSCALE", 1.0),
        bzero: float_or("BZERO", 0.0),
        data_offset: offset,
    })
}

fn check_dimensions(width: usize, height: usize) -> Result<(), StampDecodeError> {
    if width == 0 || height == 0 {
        return Err(StampDecodeError::Header(format!(
            "degenerate {width}x{height} image"
        )));
    }
    if width > MAX_STAMP_SIDE || height > MAX_STAMP_SIDE {
        return Err(StampDecodeError::Header(format!(
            "{width}x{height} image exceeds {MAX_STAMP_SIDE}x{MAX_STAMP_SIDE}"
        )));
    }
    Ok(())
}

pub fn parse_fits_primary(raw: &[u8]) -> Result<StampImage, StampDecodeError> {
    let header = parse_header(raw)?;
    let width = header.axes[0];
    let height = header.axes[1];
    let bytes_per_pixel = match header.bitpix {
        8 => 1,
        16 => 2,
        32 | -32 => 4,
        64 | -64 => 8,
        other => return Err(StampDecodeError::UnsupportedBitpix(other)),
    };
    let expected = width
        .checked_mul(height)
        .and_then(|n| n.checked_mul(bytes_per_pixel))
        .ok_or_else(|| StampDecodeError::Header(format!("{width}x{height} overflows")))?;
    let data = raw.get(header.data_offset..).unwrap_or_default();
    if data.len() < expected {
        return Err(StampDecodeError::Truncated {
            expected,
            found: data.len(),
        });
    }

    let values = data[..expected]
        .chunks_exact(bytes_per_pixel)
        .map(|px| {
            let physical = match header.bitpix {
                8 => px[0] as f64,
                16 => i16::from_be_bytes([px[0], px[1]]) as f64,
                32 => i32::from_be_bytes([px[0], px[1], px[2], px[3]]) as f64,
                -32 => f32::from_be_bytes([px[0], px[1], px[2], px[3]]) as f64,
                64 => i64::from_be_bytes(px.try_into().unwrap_or([0; 8])) as f64,
                _ => f64::from_be_bytes(px.try_into().unwrap_or([0; 8])),
            };
            header.bzero + header.bscale * physical
        })
        .collect();

    Ok(StampImage {
        width,
        height,
        data: values,
    })
}
