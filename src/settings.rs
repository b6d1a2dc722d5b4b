//! Persisting the compression settings of a loaded JPEG file with the image.
//!
//! When a JPEG is imported, its color space, per-component sampling factors and detected quality
//! are attached to the image as the `"jpeg-settings"` parasite. Quantization tables are included
//! only when the quality was not matched exactly, since standard tables can be regenerated from the
//! quality alone. A later export uses this to reproduce the original compression.
//!
//! Layout (all fields single bytes unless noted):
//!
//! ```text
//! color space | |quality| | components | tables | (h, v) * components | 128 bytes * tables
//! ```
//!
//! Table entries are 16-bit big-endian in natural order. Bytes past the end of this structure are
//! reserved and ignored.

use crate::{
    config::SubsamplingMode,
    image::{Image, Parasite},
    metadata::{ColorSpace, QuantTable, QuantizationTableSet, Sampling},
    quality::estimate_quality,
};

pub const SETTINGS_PARASITE: &str = "jpeg-settings";

const HEADER_LEN: usize = 4;
const TABLE_LEN: usize = 128;

/// The decompressor parameters the settings are recorded from.
#[derive(Debug, Clone)]
pub struct DecoderState {
    /// Color space of the encoded stream.
    pub jpeg_color_space: ColorSpace,
    /// Color space the decoder converts to.
    pub out_color_space: ColorSpace,
    /// Sampling factors, one entry per frame component.
    pub components: Vec<Sampling>,
    pub quant_tables: QuantizationTableSet,
}

/// The decoded `"jpeg-settings"` structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsBlob {
    pub color_space: ColorSpace,
    /// Magnitude of the detected quality, 0 when unknown.
    pub quality: u8,
    pub components: Vec<Sampling>,
    /// Present only when the quality was not exact.
    pub tables: Vec<QuantTable>,
}

impl SettingsBlob {
    pub fn from_state(state: &DecoderState) -> Self {
        let quality = estimate_quality(&state.quant_tables, state.components.len()).to_signed();
        let tables = if quality <= 0 {
            state.quant_tables.present().copied().collect()
        } else {
            Vec::new()
        };
        Self {
            color_space: state.jpeg_color_space,
            quality: quality.unsigned_abs() as u8,
            components: state.components.clone(),
            tables,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            HEADER_LEN + 2 * self.components.len() + TABLE_LEN * self.tables.len(),
        );
        out.push(self.color_space as u8);
        out.push(self.quality);
        out.push(self.components.len().min(255) as u8);
        out.push(self.tables.len() as u8);
        for c in &self.components {
            out.push(c.h);
            out.push(c.v);
        }
        for table in &self.tables {
            for v in table.values {
                out.extend_from_slice(&v.to_be_bytes());
            }
        }
        out
    }

    /// Decodes a blob, or returns `None` if it is truncated or out of range.
    pub fn parse(data: &[u8]) -> Option<Self> {
        let header = Header::parse(data)?;
        let mut pos = HEADER_LEN;
        let components = data[pos..pos + 2 * header.components]
            .chunks_exact(2)
            .map(|hv| Sampling::new(hv[0], hv[1]))
            .collect();
        pos += 2 * header.components;
        let tables = data[pos..pos + TABLE_LEN * header.tables]
            .chunks_exact(TABLE_LEN)
            .map(|bytes| {
                let mut values = [0; 64];
                for (v, be) in values.iter_mut().zip(bytes.chunks_exact(2)) {
                    *v = u16::from_be_bytes([be[0], be[1]]);
                }
                QuantTable::new(values)
            })
            .collect();
        Some(Self {
            color_space: ColorSpace::from_u8(data[0]),
            quality: data[1],
            components,
            tables,
        })
    }

    /// The canonical subsampling mode of the stored layout, if it has one.
    ///
    /// Only 3-component layouts whose chroma components are both 1x1 can match.
    pub fn subsampling(&self) -> Option<SubsamplingMode> {
        match self.components.as_slice() {
            [luma, Sampling::ONE, Sampling::ONE] => SubsamplingMode::from_luma_sampling(*luma),
            _ => None,
        }
    }
}

/// Counts from the blob header that passed the validity checks.
struct Header {
    components: usize,
    tables: usize,
}

impl Header {
    fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_LEN {
            return None;
        }
        let quality = data[1];
        let components = usize::from(data[2]);
        let tables = usize::from(data[3]);
        let needed = HEADER_LEN + 2 * components + TABLE_LEN * tables;
        if data.len() < needed || quality > 100 || tables > 4 {
            log::debug!(
                "ignoring invalid '{SETTINGS_PARASITE}' parasite ({} bytes, quality {quality}, {components} components, {tables} tables)",
                data.len()
            );
            return None;
        }
        Some(Self { components, tables })
    }
}

/// Settings recovered by [`restore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoredSettings {
    /// Magnitude of the original quality; 0 when unknown, -1 when nothing was restored.
    pub quality: i32,
    pub subsampling: Option<SubsamplingMode>,
    /// Number of stored tables. Negative when tables are stored for a color space other than
    /// grayscale or YCbCr, 0 when none are stored.
    pub num_quant_tables: i32,
}

impl RestoredSettings {
    /// Returned when the image carries no valid settings.
    pub const UNKNOWN: Self = Self {
        quality: -1,
        subsampling: None,
        num_quant_tables: 0,
    };
}

/// Records the settings of the file being imported into `image`.
///
/// Returns `false` (attaching nothing) only when neither the stream nor the output color space is
/// known.
pub fn detect_and_store(image: &mut Image, state: &DecoderState) -> bool {
    if state.jpeg_color_space == ColorSpace::Unknown
        && state.out_color_space == ColorSpace::Unknown
    {
        return false;
    }

    let blob = SettingsBlob::from_state(state);
    log::debug!(
        "storing original settings: {:?}, quality {}, {} tables",
        blob.color_space,
        blob.quality,
        blob.tables.len()
    );
    image.attach_parasite(Parasite::new(SETTINGS_PARASITE, true, blob.encode()));
    true
}

fn stored_blob(image: &Image) -> Option<SettingsBlob> {
    SettingsBlob::parse(image.parasite(SETTINGS_PARASITE)?.data())
}

/// Reads back the quality, subsampling and table count stored by [`detect_and_store`].
pub fn restore(image: &Image) -> RestoredSettings {
    let Some(blob) = stored_blob(image) else {
        return RestoredSettings::UNKNOWN;
    };

    let count = blob.tables.len() as i32;
    let num_quant_tables = match blob.color_space {
        ColorSpace::Grayscale | ColorSpace::YCbCr => count,
        _ => -count,
    };

    RestoredSettings {
        quality: i32::from(blob.quality),
        subsampling: blob.subsampling(),
        num_quant_tables,
    }
}

/// Returns the stored quantization tables if exactly `expected_count` of them are stored.
pub fn restore_tables(image: &Image, expected_count: i32) -> Option<Vec<QuantTable>> {
    let blob = stored_blob(image)?;
    if expected_count <= 0 || blob.tables.len() != expected_count as usize {
        return None;
    }
    Some(blob.tables)
}

/// Adjusts the stored settings after the image was rotated by 90 degrees or mirrored across a
/// diagonal: sampling factors are swapped and tables transposed. Reserved trailing bytes are kept.
pub fn swap_axes(image: &mut Image) {
    let Some(parasite) = image.parasite(SETTINGS_PARASITE) else {
        return;
    };
    let Some(header) = Header::parse(parasite.data()) else {
        return;
    };

    let mut data = parasite.data().to_vec();
    let persistent = parasite.is_persistent();

    let mut pos = HEADER_LEN;
    for hv in data[pos..pos + 2 * header.components].chunks_exact_mut(2) {
        hv.swap(0, 1);
    }
    pos += 2 * header.components;

    for bytes in data[pos..pos + TABLE_LEN * header.tables].chunks_exact_mut(TABLE_LEN) {
        let src = bytes.to_vec();
        for i in 0..8 {
            for j in 0..8 {
                bytes[i * 16 + j * 2] = src[j * 16 + i * 2];
                bytes[i * 16 + j * 2 + 1] = src[j * 16 + i * 2 + 1];
            }
        }
    }

    image.attach_parasite(Parasite::new(SETTINGS_PARASITE, persistent, data));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{image::BaseType, quality::standard_tables};

    fn ycbcr_state(components: Vec<Sampling>, quant_tables: QuantizationTableSet) -> DecoderState {
        DecoderState {
            jpeg_color_space: ColorSpace::YCbCr,
            out_color_space: ColorSpace::Rgb,
            components,
            quant_tables,
        }
    }

    fn standard_set(q: u8) -> QuantizationTableSet {
        let (lum, chrom) = standard_tables(q, true);
        [lum, chrom].into_iter().collect()
    }

    fn random_table(rng: &mut fastrand::Rng) -> QuantTable {
        let mut values = [0; 64];
        // Far above the largest standard divisors, so no quality can match.
        values.iter_mut().for_each(|v| *v = rng.u16(4000..=32767));
        QuantTable::new(values)
    }

    fn image() -> Image {
        Image::new(16, 16, BaseType::Rgb)
    }

    #[test]
    fn exact_quality_stores_no_tables() {
        let mut image = image();
        let state = ycbcr_state(
            SubsamplingMode::Chroma420.component_sampling().to_vec(),
            standard_set(85),
        );
        assert!(detect_and_store(&mut image, &state));

        let parasite = image.parasite(SETTINGS_PARASITE).unwrap();
        assert!(parasite.is_persistent());
        assert_eq!(parasite.data(), &[3, 85, 3, 0, 2, 2, 1, 1, 1, 1]);

        assert_eq!(
            restore(&image),
            RestoredSettings {
                quality: 85,
                subsampling: Some(SubsamplingMode::Chroma420),
                num_quant_tables: 0,
            }
        );
        assert_eq!(restore_tables(&image, 0), None);
    }

    #[test]
    fn nonstandard_tables_round_trip() {
        let mut rng = fastrand::Rng::with_seed(42);
        for _ in 0..20 {
            let tables: QuantizationTableSet =
                [random_table(&mut rng), random_table(&mut rng)].into_iter().collect();
            assert_eq!(estimate_quality(&tables, 3).to_signed(), 0);

            let mut image = image();
            let state = ycbcr_state(
                SubsamplingMode::Chroma444.component_sampling().to_vec(),
                tables.clone(),
            );
            assert!(detect_and_store(&mut image, &state));

            let restored = restore(&image);
            assert_eq!(restored.quality, 0);
            assert_eq!(restored.num_quant_tables, 2);
            let back = restore_tables(&image, restored.num_quant_tables).unwrap();
            assert_eq!(back, tables.present().copied().collect::<Vec<_>>());

            // A stale count is refused.
            assert_eq!(restore_tables(&image, 1), None);
            assert_eq!(restore_tables(&image, 3), None);
        }
    }

    #[test]
    fn approximate_quality_keeps_tables() {
        let mut tables = standard_set(60);
        let mut lum = *tables.get(0).unwrap();
        lum.values[0] -= 1;
        tables.set(0, lum);

        let mut image = image();
        detect_and_store(
            &mut image,
            &ycbcr_state(SubsamplingMode::Chroma444.component_sampling().to_vec(), tables),
        );
        let restored = restore(&image);
        assert_eq!(restored.quality, 60);
        assert_eq!(restored.num_quant_tables, 2);
        assert_eq!(restore_tables(&image, 2).unwrap()[0], lum);
    }

    #[test]
    fn table_count_negated_outside_gray_and_ycbcr() {
        let mut rng = fastrand::Rng::with_seed(1);
        let tables: QuantizationTableSet = [random_table(&mut rng)].into_iter().collect();
        let mut image = image();
        let state = DecoderState {
            jpeg_color_space: ColorSpace::Rgb,
            out_color_space: ColorSpace::Rgb,
            components: vec![Sampling::ONE; 3],
            quant_tables: tables,
        };
        assert!(detect_and_store(&mut image, &state));
        let restored = restore(&image);
        assert_eq!(restored.num_quant_tables, -1);
        assert_eq!(restore_tables(&image, restored.num_quant_tables), None);
    }

    #[test]
    fn unknown_color_spaces_store_nothing() {
        let mut image = image();
        let mut state = ycbcr_state(vec![Sampling::ONE], standard_set(50));
        state.jpeg_color_space = ColorSpace::Unknown;
        state.out_color_space = ColorSpace::Unknown;
        assert!(!detect_and_store(&mut image, &state));
        assert!(image.parasite(SETTINGS_PARASITE).is_none());
        assert_eq!(restore(&image), RestoredSettings::UNKNOWN);

        // One known side is enough.
        state.out_color_space = ColorSpace::Grayscale;
        assert!(detect_and_store(&mut image, &state));
    }

    #[test]
    fn canonical_subsampling_round_trips() {
        for mode in SubsamplingMode::ALL {
            let mut image = image();
            let state = ycbcr_state(mode.component_sampling().to_vec(), standard_set(90));
            detect_and_store(&mut image, &state);
            assert_eq!(restore(&image).subsampling, Some(mode), "{mode:?}");
        }
    }

    #[test]
    fn noncanonical_subsampling_is_unknown() {
        let mut rng = fastrand::Rng::with_seed(9);
        for _ in 0..200 {
            let n = rng.usize(1..=4);
            let components: Vec<_> = (0..n)
                .map(|_| Sampling::new(rng.u8(1..=4), rng.u8(1..=4)))
                .collect();
            let canonical = SubsamplingMode::ALL
                .into_iter()
                .any(|m| components[..] == m.component_sampling()[..]);
            if canonical {
                continue;
            }
            let mut image = image();
            detect_and_store(&mut image, &ycbcr_state(components.clone(), standard_set(90)));
            assert_eq!(restore(&image).subsampling, None, "{components:?}");
        }
    }

    #[test]
    fn invalid_blobs_are_ignored() {
        let blob = SettingsBlob {
            color_space: ColorSpace::YCbCr,
            quality: 0,
            components: vec![Sampling::ONE; 3],
            tables: vec![QuantTable::new([7; 64])],
        };
        let full = blob.encode();
        assert_eq!(full.len(), 4 + 6 + 128);

        let cases: [&[u8]; 4] = [
            &full[..full.len() - 1],
            &full[..3],
            &[3, 101, 0, 0],
            &[3, 50, 0, 5],
        ];
        for data in cases {
            let mut image = image();
            image.attach_parasite(Parasite::new(SETTINGS_PARASITE, true, data.to_vec()));
            assert_eq!(restore(&image), RestoredSettings::UNKNOWN);
            assert_eq!(restore_tables(&image, 1), None);
            swap_axes(&mut image);
            assert_eq!(image.parasite(SETTINGS_PARASITE).unwrap().data(), data);
        }
    }

    #[test]
    fn trailing_bytes_are_tolerated() {
        let blob = SettingsBlob {
            color_space: ColorSpace::Grayscale,
            quality: 77,
            components: vec![Sampling::ONE],
            tables: Vec::new(),
        };
        let mut data = blob.encode();
        data.extend_from_slice(b"reserved");
        assert_eq!(SettingsBlob::parse(&data), Some(blob));
    }

    #[test]
    fn swap_axes_twice_is_identity() {
        let mut rng = fastrand::Rng::with_seed(3);
        let blob = SettingsBlob {
            color_space: ColorSpace::YCbCr,
            quality: 0,
            components: SubsamplingMode::Chroma422Horizontal
                .component_sampling()
                .to_vec(),
            tables: vec![random_table(&mut rng), random_table(&mut rng)],
        };
        let mut data = blob.encode();
        data.extend_from_slice(&[0xAB, 0xCD]);

        let mut image = image();
        image.attach_parasite(Parasite::new(SETTINGS_PARASITE, true, data.clone()));

        swap_axes(&mut image);
        let swapped = SettingsBlob::parse(image.parasite(SETTINGS_PARASITE).unwrap().data()).unwrap();
        assert_eq!(swapped.subsampling(), Some(SubsamplingMode::Chroma422Vertical));
        assert_eq!(swapped.tables[0], blob.tables[0].transposed());
        assert_eq!(swapped.tables[1], blob.tables[1].transposed());
        assert!(image.parasite(SETTINGS_PARASITE).unwrap().data().ends_with(&[0xAB, 0xCD]));

        swap_axes(&mut image);
        assert_eq!(image.parasite(SETTINGS_PARASITE).unwrap().data(), &data[..]);
    }

    #[test]
    fn swap_axes_without_settings_is_noop() {
        let mut image = image();
        swap_axes(&mut image);
        assert!(image.parasite(SETTINGS_PARASITE).is_none());
    }
}
