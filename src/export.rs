//! Writing an image layer as a JPEG file.

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
    rc::Rc,
};

use crate::{
    codec::{Backend, Capabilities, Compress, CompressParams, DefaultBackend, EncodeColor},
    config::{DctMethod, ExportConfig, SubsamplingMode},
    error::{Error, Result},
    image::{ColorProfile, Image, Layer, PixelBuffer, PixelFormat, Progress, Unit},
    markers::{Density, Marker},
    metadata::{QuantTable, Sampling},
    preview::PreviewSession,
    quality::standard_tables,
    settings,
};

/// Name of the parasite holding a raw EXIF block (TIFF header onwards).
pub const EXIF_PARASITE: &str = "exif-data";
/// Name of the parasite holding a serialized XMP packet.
pub const XMP_PARASITE: &str = "xmp-data";

/// Rows fetched from the source buffer per chunk.
pub const DEFAULT_TILE_HEIGHT: u32 = 64;

/// Rows between two progress reports.
const PROGRESS_INTERVAL: u32 = 32;

/// Outcome of [`Exporter::export`].
pub enum Export {
    /// The file has been written.
    Done,
    /// Nothing has been compressed yet; the session writes the file when stepped.
    Preview(PreviewSession),
}

#[derive(Clone)]
pub struct Exporter {
    backend: Rc<dyn Backend>,
    tile_height: u32,
}

impl Default for Exporter {
    fn default() -> Self {
        Self::new()
    }
}

impl Exporter {
    pub fn new() -> Self {
        Self::with_backend(Rc::new(DefaultBackend))
    }

    pub fn with_backend(backend: Rc<dyn Backend>) -> Self {
        Self {
            backend,
            tile_height: DEFAULT_TILE_HEIGHT,
        }
    }

    /// Sets the number of rows converted and handed to the codec at a time.
    pub fn tile_height(mut self, rows: u32) -> Self {
        self.tile_height = rows.max(1);
        self
    }

    pub fn backend(&self) -> &Rc<dyn Backend> {
        &self.backend
    }

    /// Exports `drawables` (exactly one layer) of `image` to `target`.
    ///
    /// `original` is the image the user is working on; its color profile, resolution and
    /// metadata parasites are written to the file. `image` supplies the simulation profile and
    /// the stored original settings.
    ///
    /// In preview mode nothing is compressed before the returned session is stepped, and EXIF
    /// and XMP are left out.
    #[allow(clippy::too_many_arguments)]
    pub fn export(
        &self,
        target: &Path,
        config: &ExportConfig,
        image: &Image,
        drawables: &[&Layer],
        original: &Image,
        preview: bool,
        progress: &mut dyn Progress,
    ) -> Result<Export> {
        let plan = self
            .plan(config, image, drawables, original, preview)
            .map_err(|e| e.in_file("Error exporting", target))?;

        if !preview {
            progress.init(&format!("Exporting '{}'", target.display()));
        }

        let file = File::create(target).map_err(|e| {
            Error::io(
                format!("Could not open '{}' for writing", target.display()),
                e,
            )
        })?;

        let mut job = self
            .start(plan, file)
            .map_err(|e| e.in_file("Error exporting", target))?;

        if preview {
            return Ok(Export::Preview(PreviewSession::new(
                job,
                target.to_path_buf(),
                self.backend.clone(),
                self.tile_height,
            )));
        }

        let height = job.height();
        while !job.is_complete() {
            if let Err(e) = job.write_chunk(|row| progress.update(f64::from(row) / f64::from(height)))
            {
                job.abort();
                return Err(e.in_file("Error exporting", target));
            }
        }
        job.finish()
            .map_err(|e| e.in_file("Error exporting", target))?;

        progress.update(1.0);
        Ok(Export::Done)
    }

    /// Validates the request and derives the codec parameters. Touches no file.
    fn plan(
        &self,
        config: &ExportConfig,
        image: &Image,
        drawables: &[&Layer],
        original: &Image,
        preview: bool,
    ) -> Result<Plan> {
        let layer = match drawables {
            [layer] => *layer,
            [] => return Err(Error::calling("no drawable to export")),
            _ => {
                return Err(Error::calling(
                    "JPEG format does not support multiple layers",
                ))
            }
        };
        let buffer = layer.buffer().clone();
        let format = buffer.format();
        if format.is_indexed() {
            return Err(Error::unsupported(
                "indexed layers must be converted to RGB or grayscale",
            ));
        }

        let cmyk_profile = match (config.cmyk, config.include_profile) {
            (true, true) => image.simulation_profile().filter(|p| p.is_cmyk()).cloned(),
            _ => None,
        };
        let color = if config.cmyk {
            if cmyk_profile.is_none() {
                log::warn!("no CMYK simulation profile, using a naive CMYK conversion");
            }
            EncodeColor::Cmyk
        } else if format.is_rgb() {
            EncodeColor::Rgb
        } else {
            EncodeColor::Gray
        };

        let caps = self.backend.capabilities();
        let params = CompressParams {
            width: buffer.width(),
            height: buffer.height(),
            color,
            quant_tables: quant_tables(config, image),
            force_baseline: config.baseline,
            sampling: sampling(config, format),
            smoothing: if config.smoothing_applicable() {
                (config.smoothing * 100.0).clamp(0.0, 100.0) as u8
            } else {
                0
            },
            // Arithmetic coding takes precedence; Huffman tables are only optimized without it.
            optimize_coding: config.optimize && !(config.arithmetic && caps.arithmetic),
            arithmetic: config.arithmetic && caps.arithmetic,
            progressive: config.progressive,
            restart_in_rows: config.restart,
            dct: dct_method(config.dct, &caps),
            density: density(original),
        };
        if config.arithmetic && !caps.arithmetic {
            log::warn!("arithmetic coding is not available, falling back to Huffman coding");
        }
        if !config.baseline && !caps.extended_tables {
            log::debug!("backend writes 8-bit tables only, divisors are clamped to 255");
        }

        let mut markers = Vec::new();
        if config.include_comment {
            if let Some(comment) = config.comment.as_deref().filter(|c| !c.is_empty()) {
                markers.push(Marker::comment(comment));
            }
        }
        if let Some(profile) = embedded_profile(config, original, cmyk_profile.as_ref()) {
            markers.extend(Marker::icc_profile(profile.icc())?);
        }
        if !preview {
            if config.include_exif {
                if let Some(p) = original.parasite(EXIF_PARASITE) {
                    markers.push(Marker::exif(p.data()));
                }
            }
            if config.include_xmp {
                if let Some(p) = original.parasite(XMP_PARASITE) {
                    markers.push(Marker::xmp(p.data()));
                }
            }
        }

        Ok(Plan {
            params,
            markers,
            buffer,
        })
    }

    fn start(&self, plan: Plan, file: File) -> Result<ScanlineJob> {
        let mut compressor = self.backend.compressor(&plan.params)?;
        for marker in plan.markers {
            if let Err(e) = compressor.write_marker(marker) {
                compressor.abort();
                return Err(e);
            }
        }
        Ok(ScanlineJob::new(
            compressor,
            plan.buffer,
            plan.params.color,
            self.tile_height,
            file,
        ))
    }
}

struct Plan {
    params: CompressParams,
    markers: Vec<Marker>,
    buffer: Rc<PixelBuffer>,
}

/// Quality-derived tables, replaced wholesale by the original file's tables when requested and
/// available.
fn quant_tables(config: &ExportConfig, image: &Image) -> Vec<QuantTable> {
    let (luma, chroma) = standard_tables(config.quality_percent(), config.baseline);
    let mut tables = vec![luma, chroma];

    if config.use_original_quality && config.original_num_quant_tables > 0 {
        match settings::restore_tables(image, config.original_num_quant_tables) {
            Some(original) => {
                let max = if config.baseline { 255 } else { 32767 };
                for (slot, table) in original.iter().enumerate() {
                    let mut table = *table;
                    table.values.iter_mut().for_each(|v| *v = (*v).clamp(1, max));
                    match tables.get_mut(slot) {
                        Some(t) => *t = table,
                        None => tables.push(table),
                    }
                }
                log::debug!("reusing {} original quantization tables", original.len());
            }
            None => log::debug!("original quantization tables unavailable"),
        }
    }
    tables
}

fn sampling(config: &ExportConfig, format: PixelFormat) -> Sampling {
    // Chroma subsampling only applies to color sources.
    let mode = if format.is_rgb() {
        config.subsampling
    } else {
        SubsamplingMode::Chroma444
    };
    mode.luma_sampling()
}

fn dct_method(dct: DctMethod, caps: &Capabilities) -> DctMethod {
    if caps.supports_dct(dct) {
        dct
    } else {
        log::debug!("{dct:?} DCT not supported by the backend");
        DctMethod::IntegerSlow
    }
}

/// JFIF density from the resolution of `image`; metric display units select dots per cm.
pub(crate) fn density(image: &Image) -> Density {
    let (mut x, mut y) = image.resolution();
    if x <= 1e-5 || y <= 1e-5 {
        return Density::default();
    }
    let unit = match image.unit() {
        Unit::Centimeter | Unit::Millimeter => {
            x /= 2.54;
            y /= 2.54;
            2
        }
        _ => 1,
    };
    Density {
        unit,
        x: x as u16,
        y: y as u16,
    }
}

/// The profile to embed, if any: the CMYK simulation profile for CMYK output (never the RGB
/// profile), the image's profile otherwise.
fn embedded_profile<'a>(
    config: &ExportConfig,
    original: &'a Image,
    cmyk_profile: Option<&'a ColorProfile>,
) -> Option<&'a ColorProfile> {
    if !config.include_profile {
        return None;
    }
    if config.cmyk {
        cmyk_profile
    } else {
        original.color_profile()
    }
}

/// A started compressor together with the source it reads rows from.
pub(crate) struct ScanlineJob {
    compressor: Box<dyn Compress>,
    buffer: Rc<PixelBuffer>,
    color: EncodeColor,
    tile_height: u32,
    tile: Vec<u8>,
    out: BufWriter<File>,
}

impl ScanlineJob {
    fn new(
        compressor: Box<dyn Compress>,
        buffer: Rc<PixelBuffer>,
        color: EncodeColor,
        tile_height: u32,
        file: File,
    ) -> Self {
        let row_bytes = buffer.width() as usize * color.components();
        Self {
            compressor,
            buffer,
            color,
            tile_height,
            tile: Vec::with_capacity(row_bytes * tile_height as usize),
            out: BufWriter::new(file),
        }
    }

    pub(crate) fn height(&self) -> u32 {
        self.buffer.height()
    }

    pub(crate) fn next_scanline(&self) -> u32 {
        self.compressor.next_scanline()
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.next_scanline() >= self.height()
    }

    /// Converts and compresses the next tile-height chunk of rows.
    ///
    /// `on_progress` is called with the next scanline whenever it reaches a multiple of 32.
    pub(crate) fn write_chunk(&mut self, mut on_progress: impl FnMut(u32)) -> Result<()> {
        let y = self.next_scanline();
        let count = self.tile_height.min(self.height() - y);
        let row_bytes = self.buffer.width() as usize * self.color.components();

        self.tile.clear();
        convert_rows(
            self.buffer.rows(y, count),
            self.buffer.format(),
            self.color,
            &mut self.tile,
        );

        let mut done = 0;
        while done < count {
            let batch = (PROGRESS_INTERVAL - (y + done) % PROGRESS_INTERVAL).min(count - done);
            let start = done as usize * row_bytes;
            let written = self
                .compressor
                .write_scanlines(&self.tile[start..], batch)?;
            if written == 0 {
                return Err(Error::from("compressor accepted no scanlines"));
            }
            done += written;
            if (y + done) % PROGRESS_INTERVAL == 0 {
                on_progress(y + done);
            }
        }
        Ok(())
    }

    /// Completes the stream and closes the file.
    pub(crate) fn finish(self) -> Result<()> {
        let Self {
            compressor,
            mut out,
            ..
        } = self;
        compressor.finish(&mut out)?;
        out.flush().map_err(|e| Error::io("writing JPEG data", e))
    }

    /// Drops the compressor without completing the stream.
    pub(crate) fn abort(self) {
        self.compressor.abort();
    }
}

/// Converts rows of `format` pixels to the codec's sample layout. Alpha is dropped.
fn convert_rows(src: &[u8], format: PixelFormat, color: EncodeColor, dst: &mut Vec<u8>) {
    let bpp = format.bytes_per_pixel();
    for px in src.chunks_exact(bpp) {
        let (r, g, b) = if format.is_rgb() {
            (px[0], px[1], px[2])
        } else {
            (px[0], px[0], px[0])
        };
        match color {
            EncodeColor::Gray => dst.push(px[0]),
            EncodeColor::Rgb => dst.extend_from_slice(&[r, g, b]),
            EncodeColor::Cmyk => dst.extend_from_slice(&naive_cmyk(r, g, b)),
        }
    }
}

/// Uncalibrated RGB to CMYK with full black generation, as Adobe-convention samples (255 = no
/// ink).
fn naive_cmyk(r: u8, g: u8, b: u8) -> [u8; 4] {
    let max = r.max(g).max(b);
    if max == 0 {
        return [255, 255, 255, 0];
    }
    let scale = |v: u8| ((u32::from(v) * 255 + u32::from(max) / 2) / u32::from(max)) as u8;
    [scale(r), scale(g), scale(b), max]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{BaseType, NoProgress};

    #[test]
    fn cmyk_conversion() {
        assert_eq!(naive_cmyk(0, 0, 0), [255, 255, 255, 0]);
        assert_eq!(naive_cmyk(255, 255, 255), [255, 255, 255, 255]);
        assert_eq!(naive_cmyk(255, 0, 0), [255, 0, 0, 255]);
        assert_eq!(naive_cmyk(100, 50, 0), [255, 128, 0, 100]);
        // Recombining inverted samples restores the color.
        let [c, m, y, k] = naive_cmyk(120, 60, 30);
        let back = |s: u8| (u32::from(s) * u32::from(k) / 255) as u8;
        assert!(back(c).abs_diff(120) <= 1);
        assert!(back(m).abs_diff(60) <= 1);
        assert!(back(y).abs_diff(30) <= 1);
    }

    #[test]
    fn rows_drop_alpha() {
        let mut out = Vec::new();
        convert_rows(&[1, 2, 3, 4, 5, 6, 7, 8], PixelFormat::Rgba, EncodeColor::Rgb, &mut out);
        assert_eq!(out, [1, 2, 3, 5, 6, 7]);
        out.clear();
        convert_rows(&[9, 255, 10, 0], PixelFormat::GrayA, EncodeColor::Gray, &mut out);
        assert_eq!(out, [9, 10]);
    }

    #[test]
    fn density_units() {
        let mut image = Image::new(1, 1, BaseType::Rgb);
        image.set_resolution(300.0, 150.0);
        assert_eq!(
            density(&image),
            Density {
                unit: 1,
                x: 300,
                y: 150
            }
        );
        image.set_unit(Unit::Millimeter);
        image.set_resolution(254.0, 254.0);
        assert_eq!(
            density(&image),
            Density {
                unit: 2,
                x: 100,
                y: 100
            }
        );
        image.set_resolution(0.0, 72.0);
        assert_eq!(density(&image), Density::default());
    }

    #[test]
    fn gray_sources_ignore_subsampling() {
        let mut config = ExportConfig::default();
        config.subsampling = SubsamplingMode::Chroma420;
        assert_eq!(sampling(&config, PixelFormat::Gray), Sampling::ONE);
        assert_eq!(sampling(&config, PixelFormat::Rgba), Sampling::new(2, 2));
    }

    #[test]
    fn original_tables_replace_quality_tables() {
        let mut image = Image::new(8, 8, BaseType::Rgb);
        let state = settings::DecoderState {
            jpeg_color_space: crate::metadata::ColorSpace::YCbCr,
            out_color_space: crate::metadata::ColorSpace::Rgb,
            components: vec![Sampling::new(2, 2), Sampling::ONE, Sampling::ONE],
            quant_tables: [QuantTable::new([3; 64]), QuantTable::new([300; 64])]
                .into_iter()
                .collect(),
        };
        assert!(settings::detect_and_store(&mut image, &state));

        let mut config = ExportConfig::default();
        config.apply_original_settings(&settings::restore(&image));
        assert_eq!(config.original_num_quant_tables, 2);

        config.use_original_quality = true;
        let tables = quant_tables(&config, &image);
        assert_eq!(tables[0].values, [3; 64]);
        assert_eq!(tables[1].values, [255; 64]);

        config.use_original_quality = false;
        let tables = quant_tables(&config, &image);
        assert_eq!(tables[0], standard_tables(config.quality_percent(), true).0);
    }

    #[test]
    fn indexed_layers_are_rejected_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jpg");
        let image = Image::new(2, 2, BaseType::Indexed);
        let layer = Layer::new("bg", PixelBuffer::new(2, 2, PixelFormat::Indexed));
        let err = Exporter::new()
            .export(
                &path,
                &ExportConfig::default(),
                &image,
                &[&layer],
                &image,
                false,
                &mut NoProgress,
            )
            .err()
            .unwrap();
        assert_eq!(err.kind(), crate::ErrorKind::UnsupportedLayout);
        assert!(err.to_string().starts_with("Error exporting '"));
        assert!(!path.exists());
    }

    #[test]
    fn unwritable_target() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("out.jpg");
        let image = Image::new(2, 2, BaseType::Gray);
        let layer = Layer::new("bg", PixelBuffer::new(2, 2, PixelFormat::Gray));
        let err = Exporter::new()
            .export(
                &path,
                &ExportConfig::default(),
                &image,
                &[&layer],
                &image,
                false,
                &mut NoProgress,
            )
            .err()
            .unwrap();
        assert_eq!(err.kind(), crate::ErrorKind::Io);
        assert!(err.to_string().starts_with("Could not open '"));
    }
}
