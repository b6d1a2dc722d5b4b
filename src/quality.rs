//! Recovering the encoder quality setting from a file's quantization tables.
//!
//! Encoders derived from the IJG library scale the two Annex K example tables uniformly with the
//! quality setting, so the sum of the 64 divisors is a monotonic function of the quality. Comparing
//! the observed sums against the sums of the reference tables at every quality recovers the setting
//! exactly for such files, and a close upper bound ("at most this good") for others.

use std::sync::OnceLock;

use crate::metadata::{QuantTable, QuantizationTableSet};

/// Annex K.1 luminance table, natural order.
const LUMINANCE: [u16; 64] = [
    16, 11, 10, 16, 24, 40, 51, 61, //
    12, 12, 14, 19, 26, 58, 60, 55, //
    14, 13, 16, 24, 40, 57, 69, 56, //
    14, 17, 22, 29, 51, 87, 80, 62, //
    18, 22, 37, 56, 68, 109, 103, 77, //
    24, 35, 55, 64, 81, 104, 113, 92, //
    49, 64, 78, 87, 103, 121, 120, 101, //
    72, 92, 95, 98, 112, 100, 103, 99, //
];

/// Annex K.2 chrominance table, natural order.
const CHROMINANCE: [u16; 64] = [
    17, 18, 24, 47, 99, 99, 99, 99, //
    18, 21, 26, 66, 99, 99, 99, 99, //
    24, 26, 56, 99, 99, 99, 99, 99, //
    47, 66, 99, 99, 99, 99, 99, 99, //
    99, 99, 99, 99, 99, 99, 99, 99, //
    99, 99, 99, 99, 99, 99, 99, 99, //
    99, 99, 99, 99, 99, 99, 99, 99, //
    99, 99, 99, 99, 99, 99, 99, 99, //
];

/// Largest divisor a baseline (8-bit table) stream can hold.
const BASELINE_MAX: u16 = 255;
const EXTENDED_MAX: u16 = 32767;

/// The outcome of [`estimate_quality`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectedQuality {
    /// No reference curve matches, or the layout is not modeled (CMYK, 4 tables).
    Unknown,
    /// Both sums equal the reference tables at this quality.
    Exact(u8),
    /// The tables are at most as good as this quality.
    Approximate(u8),
}

impl DetectedQuality {
    /// Signed form: `+q` exact, `-q` approximate, `0` unknown.
    pub fn to_signed(self) -> i32 {
        match self {
            Self::Unknown => 0,
            Self::Exact(q) => i32::from(q),
            Self::Approximate(q) => -i32::from(q),
        }
    }

    pub fn from_signed(value: i32) -> Self {
        match value {
            1..=100 => Self::Exact(value as u8),
            -100..=-1 => Self::Approximate(value.unsigned_abs() as u8),
            _ => Self::Unknown,
        }
    }

    /// The matched quality, exact or not.
    pub fn quality(self) -> Option<u8> {
        match self {
            Self::Unknown => None,
            Self::Exact(q) | Self::Approximate(q) => Some(q),
        }
    }

    #[inline]
    pub fn is_exact(self) -> bool {
        matches!(self, Self::Exact(_))
    }
}

/// The IJG percentage scale factor for a quality in `1..=100` (out-of-range values are clamped).
pub fn quality_scaling(quality: u8) -> u32 {
    let q = u32::from(quality.clamp(1, 100));
    if q < 50 {
        5000 / q
    } else {
        200 - q * 2
    }
}

/// Generates the luminance and chrominance tables an IJG encoder uses at `quality`.
///
/// With `force_baseline` the divisors are limited to 255 so they fit 8-bit DQT entries.
pub fn standard_tables(quality: u8, force_baseline: bool) -> (QuantTable, QuantTable) {
    let scale = quality_scaling(quality);
    (
        scale_table(&LUMINANCE, scale, force_baseline),
        scale_table(&CHROMINANCE, scale, force_baseline),
    )
}

fn scale_table(base: &[u16; 64], scale: u32, force_baseline: bool) -> QuantTable {
    let max = if force_baseline {
        BASELINE_MAX
    } else {
        EXTENDED_MAX
    };
    let mut values = [0; 64];
    for (dst, &b) in values.iter_mut().zip(base) {
        let v = (u32::from(b) * scale + 50) / 100;
        *dst = v.clamp(1, u32::from(max)) as u16;
    }
    QuantTable::new(values)
}

/// Luminance and chrominance sums of the reference tables, indexed by quality (index 0 unused).
struct ReferenceCurve {
    lum: [u32; 101],
    chrom: [u32; 101],
}

impl ReferenceCurve {
    fn generate(force_baseline: bool) -> Self {
        let mut curve = Self {
            lum: [0; 101],
            chrom: [0; 101],
        };
        for q in 1..=100u8 {
            let (lum, chrom) = standard_tables(q, force_baseline);
            curve.lum[usize::from(q)] = lum.sum();
            curve.chrom[usize::from(q)] = chrom.sum();
        }
        curve
    }

    fn get(force_baseline: bool) -> &'static Self {
        static BASELINE: OnceLock<ReferenceCurve> = OnceLock::new();
        static EXTENDED: OnceLock<ReferenceCurve> = OnceLock::new();
        if force_baseline {
            BASELINE.get_or_init(|| Self::generate(true))
        } else {
            EXTENDED.get_or_init(|| Self::generate(false))
        }
    }

    /// Walks from quality 100 down and stops at the first reference at least as coarse as the
    /// observation.
    fn search(&self, lum: u32, chrom: Option<u32>) -> DetectedQuality {
        for q in (1..=100u8).rev() {
            let i = usize::from(q);
            let (observed, reference, exact) = match chrom {
                Some(chrom) => (
                    lum + chrom,
                    self.lum[i] + self.chrom[i],
                    lum == self.lum[i] && chrom == self.chrom[i],
                ),
                None => (lum, self.lum[i], lum == self.lum[i]),
            };
            if observed <= reference {
                return if exact {
                    DetectedQuality::Exact(q)
                } else {
                    DetectedQuality::Approximate(q)
                };
            }
        }
        DetectedQuality::Unknown
    }
}

/// Tables whose divisors sum to less than this cannot come from a sane encoder.
const MIN_TABLE_SUM: u32 = 64;

/// Estimates the IJG quality setting that produced `tables`.
///
/// `num_components` is the number of frame components; a single component is matched on the
/// luminance table alone. The chrominance sum is taken from whichever of slots 1 and 2 is lower.
///
/// The baseline reference curve is searched unless some divisor exceeds 255, in which case the
/// tables cannot be baseline and the unclamped curve is searched instead.
pub fn estimate_quality(tables: &QuantizationTableSet, num_components: usize) -> DetectedQuality {
    if num_components > 3 || tables.get(3).is_some() {
        return DetectedQuality::Unknown;
    }

    let Some(lum) = tables.get(0).filter(|t| t.sum() >= MIN_TABLE_SUM) else {
        return DetectedQuality::Unknown;
    };

    let chrom = if num_components > 1 {
        let chrom = [tables.get(1), tables.get(2)]
            .into_iter()
            .flatten()
            .filter(|t| t.sum() >= MIN_TABLE_SUM)
            .min_by_key(|t| t.sum());
        match chrom {
            Some(chrom) => Some(chrom),
            None => return DetectedQuality::Unknown,
        }
    } else {
        None
    };

    let max = lum.max().max(chrom.map_or(0, QuantTable::max));
    let curve = ReferenceCurve::get(max <= BASELINE_MAX);
    let quality = curve.search(lum.sum(), chrom.map(QuantTable::sum));
    log::debug!(
        "luminance sum {}, chrominance sum {:?}: {:?}",
        lum.sum(),
        chrom.map(QuantTable::sum),
        quality
    );
    quality
}
