//! The codec seam.
//!
//! The pipelines drive a libjpeg-shaped interface: parameters are fixed up front, markers are
//! written after the stream header, scanlines are pushed (or pulled) in chunks, and a compressor
//! is either finished or aborted. [`DefaultBackend`] implements it on top of `jpeg-encoder` and
//! `jpeg-decoder`.
//!
//! CMYK samples crossing this interface use the Adobe convention (inverted, 255 is no ink).

use std::io::Write;

use jpeg_encoder::{ColorType, Encoder, QuantizationTableType, SamplingFactor};

use crate::{
    config::DctMethod,
    error::{Error, Result},
    markers::{self, Density, Marker},
    metadata::{QuantTable, Sampling},
    smooth::smooth,
};

/// Color layout of the samples handed to a compressor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeColor {
    Gray,
    Rgb,
    Cmyk,
}

impl EncodeColor {
    pub fn components(self) -> usize {
        match self {
            Self::Gray => 1,
            Self::Rgb => 3,
            Self::Cmyk => 4,
        }
    }
}

/// Everything a compressor needs before the first scanline.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressParams {
    pub width: u32,
    pub height: u32,
    pub color: EncodeColor,
    /// Tables by slot; the first is used for luminance, the second (if any) for chrominance.
    pub quant_tables: Vec<QuantTable>,
    pub force_baseline: bool,
    /// Sampling factors of the first component; all others use 1x1.
    pub sampling: Sampling,
    /// libjpeg smoothing factor, `0..=100`.
    pub smoothing: u8,
    pub optimize_coding: bool,
    pub arithmetic: bool,
    pub progressive: bool,
    /// Restart interval in MCU rows, 0 for none.
    pub restart_in_rows: u32,
    pub dct: DctMethod,
    pub density: Density,
}

/// Optional encoder features a backend may lack.
///
/// Every backend handles a luminance and a chrominance table. Further tables (slot 2 and up, as
/// found in some three-table files) may be dropped, in which case components fall back to the
/// first two slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub arithmetic: bool,
    /// Quantization divisors above 255 (non-baseline tables).
    pub extended_tables: bool,
    pub fast_dct: bool,
    pub float_dct: bool,
}

impl Capabilities {
    pub fn supports_dct(&self, dct: DctMethod) -> bool {
        match dct {
            DctMethod::IntegerSlow => true,
            DctMethod::IntegerFast => self.fast_dct,
            DctMethod::Float => self.float_dct,
        }
    }
}

pub trait Backend {
    fn capabilities(&self) -> Capabilities;

    fn compressor(&self, params: &CompressParams) -> Result<Box<dyn Compress>>;

    /// Reads the stream header of `data` and prepares to decode it.
    fn decompressor(&self, data: &[u8]) -> Result<Box<dyn Decompress>>;
}

pub trait Compress {
    /// Queues a marker segment to be written right after the stream header.
    fn write_marker(&mut self, marker: Marker) -> Result<()>;

    /// Accepts `count` rows of interleaved samples, returning the number of rows consumed.
    fn write_scanlines(&mut self, rows: &[u8], count: u32) -> Result<u32>;

    fn next_scanline(&self) -> u32;

    /// Completes the stream and writes it to `out`.
    fn finish(self: Box<Self>, out: &mut dyn Write) -> Result<()>;

    /// Discards the compressor without producing output.
    fn abort(self: Box<Self>);
}

pub trait Decompress {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    /// Samples per pixel in the output (1, 3 or 4).
    fn output_components(&self) -> usize;

    /// Decodes up to `max_rows` rows into `buf`, returning how many were produced.
    fn read_scanlines(&mut self, buf: &mut [u8], max_rows: u32) -> Result<u32>;

    fn output_scanline(&self) -> u32;
}

/// Restart interval in MCUs for an interval given in MCU rows.
pub fn restart_interval_mcus(params: &CompressParams) -> u16 {
    if params.restart_in_rows == 0 {
        return 0;
    }
    let mcu_width = match params.color {
        EncodeColor::Rgb => 8 * u32::from(params.sampling.h.max(1)),
        _ => 8,
    };
    let mcus_per_row = params.width.div_ceil(mcu_width).max(1);
    let mcus = u64::from(params.restart_in_rows) * u64::from(mcus_per_row);
    mcus.min(u64::from(u16::MAX)) as u16
}

/// `jpeg-encoder` for compression, `jpeg-decoder` for decompression.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultBackend;

impl Backend for DefaultBackend {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            arithmetic: false,
            extended_tables: false,
            fast_dct: false,
            float_dct: false,
        }
    }

    fn compressor(&self, params: &CompressParams) -> Result<Box<dyn Compress>> {
        let check = |what: &str, v: u32| {
            if v == 0 || v > u32::from(u16::MAX) {
                Err(Error::calling(format!(
                    "image {what} {v} is outside the JPEG range 1-65535"
                )))
            } else {
                Ok(())
            }
        };
        check("width", params.width)?;
        check("height", params.height)?;
        if params.quant_tables.is_empty() {
            return Err(Error::calling("no quantization tables given"));
        }

        log::debug!(
            "compressing {}x{} {:?}, sampling {}x{}, restart {} MCUs",
            params.width,
            params.height,
            params.color,
            params.sampling.h,
            params.sampling.v,
            restart_interval_mcus(params),
        );
        let len = params.width as usize * params.height as usize * params.color.components();
        Ok(Box::new(BufferedCompressor {
            params: params.clone(),
            samples: Vec::with_capacity(len),
            markers: Vec::new(),
            next_scanline: 0,
        }))
    }

    fn decompressor(&self, data: &[u8]) -> Result<Box<dyn Decompress>> {
        let mut decoder = jpeg_decoder::Decoder::new(data);
        let mut pixels = decoder.decode().map_err(|e| Error::from(e.to_string()))?;
        let info = decoder
            .info()
            .ok_or_else(|| Error::from("decoder produced no image info"))?;
        let components = match info.pixel_format {
            jpeg_decoder::PixelFormat::L8 => 1,
            jpeg_decoder::PixelFormat::RGB24 => 3,
            jpeg_decoder::PixelFormat::CMYK32 => {
                // Back to the Adobe convention.
                pixels.iter_mut().for_each(|s| *s = 255 - *s);
                4
            }
            other => {
                return Err(Error::unsupported(format!(
                    "JPEG pixel format {other:?} is not supported"
                )))
            }
        };
        log::trace!(
            "decoded {}x{} with {components} components",
            info.width,
            info.height
        );

        Ok(Box::new(DecodedImage {
            width: info.width.into(),
            height: info.height.into(),
            components,
            pixels,
            next_row: 0,
        }))
    }
}

struct BufferedCompressor {
    params: CompressParams,
    samples: Vec<u8>,
    markers: Vec<Marker>,
    next_scanline: u32,
}

impl BufferedCompressor {
    fn row_bytes(&self) -> usize {
        self.params.width as usize * self.params.color.components()
    }

    fn sampling_factor(&self) -> SamplingFactor {
        let Sampling { h, v } = self.params.sampling;
        match (self.params.color, h, v) {
            (EncodeColor::Rgb, 2, 2) => SamplingFactor::R_4_2_0,
            (EncodeColor::Rgb, 2, 1) => SamplingFactor::R_4_2_2,
            (EncodeColor::Rgb, 1, 2) => SamplingFactor::R_4_4_0,
            (EncodeColor::Rgb, 1, 1) | (EncodeColor::Gray, ..) => SamplingFactor::R_4_4_4,
            (color, h, v) => {
                log::debug!("sampling {h}x{v} not applied to {color:?} data, using 1x1");
                SamplingFactor::R_4_4_4
            }
        }
    }

    fn table(&self, slot: usize) -> QuantizationTableType {
        let tables = &self.params.quant_tables;
        let table = tables.get(slot).unwrap_or(&tables[0]);
        let mut values = table.values;
        if values.iter().any(|&v| v > 255) {
            log::debug!("quantization table {slot} has divisors above 255, clamping");
        }
        for v in &mut values {
            *v = (*v).clamp(1, 255);
        }
        QuantizationTableType::Custom(Box::new(values))
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let p = &self.params;
        if p.arithmetic {
            log::debug!("arithmetic coding unavailable, using Huffman coding");
        }
        if p.dct != DctMethod::IntegerSlow {
            log::debug!("{:?} DCT unavailable, using the accurate integer DCT", p.dct);
        }

        let channels = p.color.components();
        let mut data = smooth(&self.samples, p.width, p.height, channels, p.smoothing);
        let color_type = match p.color {
            EncodeColor::Gray => ColorType::Luma,
            EncodeColor::Rgb => ColorType::Rgb,
            EncodeColor::Cmyk => {
                data.iter_mut().for_each(|s| *s = 255 - *s);
                ColorType::Cmyk
            }
        };

        let mut encoded = Vec::new();
        let mut encoder = Encoder::new(&mut encoded, 100);
        encoder.set_sampling_factor(self.sampling_factor());
        encoder.set_progressive(p.progressive);
        encoder.set_optimized_huffman_tables(p.optimize_coding);
        encoder.set_restart_interval(restart_interval_mcus(p));
        if p.quant_tables.len() > 2 {
            log::debug!(
                "only two quantization tables are supported, dropping {} more",
                p.quant_tables.len() - 2
            );
        }
        encoder.set_quantization_tables(self.table(0), self.table(1));
        // Dimensions were range-checked when the compressor was created.
        encoder
            .encode(&data, p.width as u16, p.height as u16, color_type)
            .map_err(|e| Error::from(e.to_string()))?;

        let jfif = match p.color {
            EncodeColor::Cmyk => None,
            _ => Some(p.density),
        };
        markers::splice(&encoded, jfif, &self.markers)
    }
}

impl Compress for BufferedCompressor {
    fn write_marker(&mut self, marker: Marker) -> Result<()> {
        if self.next_scanline > 0 {
            return Err(Error::calling("markers must be written before any scanline"));
        }
        self.markers.push(marker);
        Ok(())
    }

    fn write_scanlines(&mut self, rows: &[u8], count: u32) -> Result<u32> {
        let count = count.min(self.params.height - self.next_scanline);
        let len = count as usize * self.row_bytes();
        let rows = rows.get(..len).ok_or_else(|| {
            Error::calling(format!(
                "scanline buffer holds {} bytes, {count} rows need {len}",
                rows.len()
            ))
        })?;
        self.samples.extend_from_slice(rows);
        self.next_scanline += count;
        Ok(count)
    }

    fn next_scanline(&self) -> u32 {
        self.next_scanline
    }

    fn finish(self: Box<Self>, out: &mut dyn Write) -> Result<()> {
        if self.next_scanline < self.params.height {
            return Err(Error::from(format!(
                "compression finished after {} of {} scanlines",
                self.next_scanline, self.params.height
            )));
        }
        let stream = self.encode()?;
        out.write_all(&stream)
            .map_err(|e| Error::io("writing JPEG data", e))
    }

    fn abort(self: Box<Self>) {
        log::trace!("compression aborted at scanline {}", self.next_scanline);
    }
}

struct DecodedImage {
    width: u32,
    height: u32,
    components: usize,
    pixels: Vec<u8>,
    next_row: u32,
}

impl Decompress for DecodedImage {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn output_components(&self) -> usize {
        self.components
    }

    fn read_scanlines(&mut self, buf: &mut [u8], max_rows: u32) -> Result<u32> {
        let row_bytes = self.width as usize * self.components;
        let rows = max_rows
            .min(self.height - self.next_row)
            .min((buf.len() / row_bytes.max(1)) as u32);
        let start = self.next_row as usize * row_bytes;
        let len = rows as usize * row_bytes;
        let src = self
            .pixels
            .get(start..start + len)
            .ok_or_else(|| Error::from("decoded image is shorter than its header claims"))?;
        buf[..len].copy_from_slice(src);
        self.next_row += rows;
        Ok(rows)
    }

    fn output_scanline(&self) -> u32 {
        self.next_row
    }
}
