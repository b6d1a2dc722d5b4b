//! Loading JPEG files into an [`Image`].

use std::{fs, path::Path, rc::Rc};

use crate::{
    codec::{Backend, DefaultBackend},
    config::COMMENT_PARASITE,
    error::{Error, Result},
    export::{DEFAULT_TILE_HEIGHT, EXIF_PARASITE, XMP_PARASITE},
    file::{AppKind, DensityUnit, JpegParser, SegmentKind, SofMarker},
    image::{BaseType, ColorProfile, Image, Layer, Parasite, PixelBuffer, PixelFormat, Unit},
    metadata::{ColorSpace, QuantizationTableSet, Sampling},
    settings::{self, DecoderState},
};

/// Name of the layer holding the decoded pixels.
pub const LAYER_NAME: &str = "Background";
/// Name of the layer created when decoding a preview.
pub const PREVIEW_LAYER_NAME: &str = "JPEG preview";

/// A frame component as declared in the SOF header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Component {
    pub id: u8,
    pub sampling: Sampling,
    pub quant_table: u8,
}

/// JFIF pixel density.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JfifDensity {
    pub unit: DensityUnit,
    pub x: u16,
    pub y: u16,
}

/// Everything read from the markers preceding the first scan.
#[derive(Debug, Clone)]
pub struct JpegHeader {
    pub width: u16,
    pub height: u16,
    pub precision: u8,
    pub coding: SofMarker,
    pub components: Vec<Component>,
    pub quant_tables: QuantizationTableSet,
    pub restart_interval: u16,
    pub jfif: Option<JfifDensity>,
    pub adobe_transform: Option<u8>,
    /// Raw bytes of each COM segment, in file order.
    pub comments: Vec<Vec<u8>>,
    pub icc_profile: Option<Vec<u8>>,
    pub exif: Option<Vec<u8>>,
    pub xmp: Option<Vec<u8>>,
}

impl JpegHeader {
    /// The color space of the stream, inferred the way libjpeg does it.
    pub fn color_space(&self) -> ColorSpace {
        match self.components.len() {
            1 => ColorSpace::Grayscale,
            3 => {
                if self.jfif.is_some() {
                    return ColorSpace::YCbCr;
                }
                match self.adobe_transform {
                    Some(0) => ColorSpace::Rgb,
                    Some(_) => ColorSpace::YCbCr,
                    None => {
                        let ids: Vec<u8> = self.components.iter().map(|c| c.id).collect();
                        if ids == b"RGB" {
                            ColorSpace::Rgb
                        } else {
                            ColorSpace::YCbCr
                        }
                    }
                }
            }
            4 => match self.adobe_transform {
                Some(2) => ColorSpace::Ycck,
                _ => ColorSpace::Cmyk,
            },
            _ => ColorSpace::Unknown,
        }
    }

    /// The color space the decoder produces for this stream.
    pub fn out_color_space(&self) -> ColorSpace {
        match self.color_space() {
            ColorSpace::Grayscale => ColorSpace::Grayscale,
            ColorSpace::Rgb | ColorSpace::YCbCr => ColorSpace::Rgb,
            ColorSpace::Cmyk | ColorSpace::Ycck => ColorSpace::Cmyk,
            ColorSpace::Unknown => ColorSpace::Unknown,
        }
    }

    pub fn decoder_state(&self) -> DecoderState {
        DecoderState {
            jpeg_color_space: self.color_space(),
            out_color_space: self.out_color_space(),
            components: self.components.iter().map(|c| c.sampling).collect(),
            quant_tables: self.quant_tables.clone(),
        }
    }

    /// All comments joined by newlines, with invalid UTF-8 replaced by `?`.
    pub fn comment(&self) -> Option<String> {
        if self.comments.is_empty() {
            return None;
        }
        let mut text = String::new();
        for (i, bytes) in self.comments.iter().enumerate() {
            if i > 0 {
                text.push('\n');
            }
            for chunk in bytes.utf8_chunks() {
                text.push_str(chunk.valid());
                text.extend(chunk.invalid().iter().map(|_| '?'));
            }
        }
        Some(text)
    }
}

/// Parses the markers up to the first scan header. Entropy-coded data is never examined.
pub fn read_header(data: &[u8]) -> Result<JpegHeader> {
    let mut parser = JpegParser::new(data)?;
    let mut frame = None;
    let mut quant_tables = QuantizationTableSet::new();
    let mut restart_interval = 0;
    let mut jfif = None;
    let mut adobe_transform = None;
    let mut comments = Vec::new();
    let mut icc_chunks = Vec::new();
    let mut exif = None;
    let mut xmp = None;

    loop {
        let Some(segment) = parser.next_segment()? else {
            break;
        };
        log::trace!("{:?}", segment.as_segment_kind());
        match segment.as_segment_kind() {
            Some(SegmentKind::Dqt(dqt)) => {
                for table in dqt.tables() {
                    quant_tables.set(table.Tq().into(), *table.table());
                }
            }
            Some(SegmentKind::Sof(sof)) => {
                if frame.is_some() {
                    return Err(Error::from("multiple SOF markers"));
                }
                let components = sof
                    .components()
                    .iter()
                    .map(|c| Component {
                        id: c.Ci(),
                        sampling: Sampling::new(c.Hi(), c.Vi()),
                        quant_table: c.Tqi(),
                    })
                    .collect::<Vec<_>>();
                frame = Some((sof.X(), sof.Y(), sof.P(), sof.sof(), components));
            }
            Some(SegmentKind::Dri(dri)) => restart_interval = dri.Ri(),
            Some(SegmentKind::Com(com)) => comments.push(com.bytes().to_vec()),
            Some(SegmentKind::App(app)) => match app.as_app_kind() {
                Some(AppKind::Jfif(j)) if jfif.is_none() => {
                    jfif = Some(JfifDensity {
                        unit: j.unit(),
                        x: j.density_x(),
                        y: j.density_y(),
                    })
                }
                Some(AppKind::Adobe(a)) => adobe_transform = Some(a.transform()),
                Some(AppKind::Icc(chunk)) => {
                    icc_chunks.push((chunk.seq(), chunk.count(), chunk.data()))
                }
                Some(AppKind::Exif(payload)) if exif.is_none() => exif = Some(payload.to_vec()),
                Some(AppKind::Xmp(payload)) if xmp.is_none() => xmp = Some(payload.to_vec()),
                _ => {}
            },
            Some(SegmentKind::Sos(_)) => break,
            _ => {}
        }
    }

    let Some((width, height, precision, coding, components)) = frame else {
        return Err(Error::from("no frame header before the first scan"));
    };

    Ok(JpegHeader {
        width,
        height,
        precision,
        coding,
        components,
        quant_tables,
        restart_interval,
        jfif,
        adobe_transform,
        comments,
        icc_profile: assemble_icc(&icc_chunks),
        exif,
        xmp,
    })
}

/// Joins ICC chunks by sequence number. Incomplete or inconsistent sets yield `None`.
fn assemble_icc(chunks: &[(u8, u8, &[u8])]) -> Option<Vec<u8>> {
    let &(_, count, _) = chunks.first()?;
    if count == 0 || chunks.len() != usize::from(count) {
        log::warn!(
            "ignoring ICC profile: {} of {count} chunks present",
            chunks.len()
        );
        return None;
    }
    let mut ordered: Vec<Option<&[u8]>> = vec![None; usize::from(count)];
    for &(seq, n, data) in chunks {
        if n != count || seq == 0 || seq > count || ordered[usize::from(seq - 1)].is_some() {
            log::warn!("ignoring ICC profile: inconsistent chunk {seq}/{n}");
            return None;
        }
        ordered[usize::from(seq - 1)] = Some(data);
    }
    Some(ordered.into_iter().flatten().flatten().copied().collect())
}

/// A loaded image, with a warning when only part of the pixel data could be decoded.
pub struct Imported {
    pub image: Image,
    pub warning: Option<String>,
}

#[derive(Clone)]
pub struct Importer {
    backend: Rc<dyn Backend>,
    tile_height: u32,
}

impl Default for Importer {
    fn default() -> Self {
        Self::new()
    }
}

impl Importer {
    pub fn new() -> Self {
        Self::with_backend(Rc::new(DefaultBackend))
    }

    pub fn with_backend(backend: Rc<dyn Backend>) -> Self {
        Self {
            backend,
            tile_height: DEFAULT_TILE_HEIGHT,
        }
    }

    /// Sets the number of rows decoded per chunk.
    pub fn tile_height(mut self, rows: u32) -> Self {
        self.tile_height = rows.max(1);
        self
    }

    pub fn import(&self, path: &Path, preview: bool) -> Result<Imported> {
        let data = fs::read(path).map_err(|e| {
            Error::io(format!("Could not open '{}' for reading", path.display()), e)
        })?;
        self.import_bytes(&data, preview)
            .map_err(|e| e.in_file("Error loading", path))
    }

    /// Decodes `data`. In preview mode metadata is skipped and the layer gets an alpha channel.
    pub fn import_bytes(&self, data: &[u8], preview: bool) -> Result<Imported> {
        let header = read_header(data)?;
        let color_space = header.color_space();
        let mut decoder = self.backend.decompressor(data)?;

        let (width, height) = (decoder.width(), decoder.height());
        let components = decoder.output_components();
        let from_cmyk = match (components, color_space) {
            (1, _) | (3, _) => false,
            (4, ColorSpace::Cmyk | ColorSpace::Ycck) => true,
            _ => {
                return Err(Error::unsupported(format!(
                    "don't know how to load JPEG images with {components} color channels, \
                     using colorspace {color_space:?}"
                )))
            }
        };
        let (base_type, format) = match (components, preview) {
            (1, false) => (BaseType::Gray, PixelFormat::Gray),
            (1, true) => (BaseType::Gray, PixelFormat::GrayA),
            (_, false) => (BaseType::Rgb, PixelFormat::Rgb),
            (_, true) => (BaseType::Rgb, PixelFormat::Rgba),
        };

        let mut image = Image::new(width, height, base_type);
        if !preview {
            store_metadata(&mut image, &header, from_cmyk);
        }

        let mut buffer = PixelBuffer::new(width, height, format);
        let row_bytes = width as usize * components;
        let mut rows = vec![0; row_bytes * self.tile_height as usize];
        let mut warning = None;
        while decoder.output_scanline() < height {
            let y = decoder.output_scanline();
            let wanted = self.tile_height.min(height - y);
            match decoder.read_scanlines(&mut rows, wanted) {
                Ok(0) => {
                    warning = Some(format!("decoder stopped after {y} of {height} rows"));
                    break;
                }
                Ok(count) => {
                    let src = &rows[..count as usize * row_bytes];
                    store_rows(src, components, from_cmyk, buffer.rows_mut(y, count));
                }
                Err(e) if y == 0 => return Err(e),
                Err(e) => {
                    log::warn!("keeping {y} of {height} rows: {e}");
                    warning = Some(e.to_string());
                    break;
                }
            }
        }

        let name = if preview {
            PREVIEW_LAYER_NAME
        } else {
            LAYER_NAME
        };
        image.insert_layer(Layer::new(name, buffer));
        Ok(Imported { image, warning })
    }
}

/// Copies decoded rows into `dst`, converting CMYK and filling alpha.
fn store_rows(src: &[u8], components: usize, from_cmyk: bool, dst: &mut [u8]) {
    let dst_channels = dst.len() / (src.len() / components).max(1);
    for (px, out) in src
        .chunks_exact(components)
        .zip(dst.chunks_exact_mut(dst_channels))
    {
        if from_cmyk {
            let k = u32::from(px[3]);
            for (o, &s) in out.iter_mut().zip(&px[..3]) {
                *o = (u32::from(s) * k / 255) as u8;
            }
        } else {
            out[..components].copy_from_slice(px);
        }
        if dst_channels == 2 || dst_channels == 4 {
            out[dst_channels - 1] = 255;
        }
    }
}

fn store_metadata(image: &mut Image, header: &JpegHeader, from_cmyk: bool) {
    settings::detect_and_store(image, &header.decoder_state());

    if let Some((x, y)) = header.jfif.and_then(resolution) {
        image.set_resolution(x, y);
        if let Some(JfifDensity {
            unit: DensityUnit::DotsPerCm,
            ..
        }) = header.jfif
        {
            image.set_unit(Unit::Millimeter);
        }
    }

    if let Some(comment) = header.comment() {
        let mut data = comment.into_bytes();
        data.push(0);
        image.attach_parasite(Parasite::new(COMMENT_PARASITE, true, data));
    }

    if let Some(icc) = &header.icc_profile {
        match ColorProfile::from_icc(icc.clone()) {
            Some(profile) if from_cmyk => image.set_simulation_profile(Some(profile)),
            Some(profile) => image.set_color_profile(Some(profile)),
            None => log::warn!("ignoring invalid ICC profile of {} bytes", icc.len()),
        }
    }

    if let Some(exif) = &header.exif {
        image.attach_parasite(Parasite::new(EXIF_PARASITE, true, exif.clone()));
    }
    if let Some(xmp) = &header.xmp {
        image.attach_parasite(Parasite::new(XMP_PARASITE, true, xmp.clone()));
    }
}

/// Resolution in dots per inch for a JFIF density, or `None` if it is degenerate.
fn resolution(density: JfifDensity) -> Option<(f64, f64)> {
    let (x, y) = (f64::from(density.x), f64::from(density.y));
    let (x, y) = match density.unit {
        // Only the aspect ratio is known.
        DensityUnit::None if y > 0.0 => (72.0 * x / y, 72.0),
        DensityUnit::None => return None,
        DensityUnit::DotsPerInch => (x, y),
        DensityUnit::DotsPerCm => (x * 2.54, y * 2.54),
        DensityUnit::Unknown(unit) => {
            log::warn!("unknown density unit {unit}, assuming dots per inch");
            (x, y)
        }
    };
    (x > 1e-5 && y > 1e-5).then_some((x, y))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn component(id: u8) -> Component {
        Component {
            id,
            sampling: Sampling::ONE,
            quant_table: 0,
        }
    }

    fn header(ids: &[u8]) -> JpegHeader {
        JpegHeader {
            width: 1,
            height: 1,
            precision: 8,
            coding: SofMarker::SOF0,
            components: ids.iter().map(|&id| component(id)).collect(),
            quant_tables: QuantizationTableSet::new(),
            restart_interval: 0,
            jfif: None,
            adobe_transform: None,
            comments: Vec::new(),
            icc_profile: None,
            exif: None,
            xmp: None,
        }
    }

    #[test]
    fn color_space_inference() {
        assert_eq!(header(&[1]).color_space(), ColorSpace::Grayscale);
        assert_eq!(header(&[1, 2, 3]).color_space(), ColorSpace::YCbCr);
        assert_eq!(header(b"RGB").color_space(), ColorSpace::Rgb);

        let mut h = header(b"RGB");
        h.jfif = Some(JfifDensity {
            unit: DensityUnit::None,
            x: 1,
            y: 1,
        });
        assert_eq!(h.color_space(), ColorSpace::YCbCr);

        let mut h = header(&[1, 2, 3]);
        h.adobe_transform = Some(0);
        assert_eq!(h.color_space(), ColorSpace::Rgb);

        let mut h = header(&[1, 2, 3, 4]);
        assert_eq!(h.color_space(), ColorSpace::Cmyk);
        h.adobe_transform = Some(2);
        assert_eq!(h.color_space(), ColorSpace::Ycck);
        assert_eq!(h.out_color_space(), ColorSpace::Cmyk);

        assert_eq!(header(&[1, 2]).color_space(), ColorSpace::Unknown);
    }

    #[test]
    fn comments_are_joined_and_sanitized() {
        let mut h = header(&[1]);
        assert_eq!(h.comment(), None);
        h.comments = vec![b"first".to_vec(), b"caf\xe9 ok".to_vec(), "\u{e9}".into()];
        assert_eq!(h.comment().unwrap(), "first\ncaf? ok\n\u{e9}");
    }

    #[test]
    fn icc_assembly() {
        let chunks = [(2, 2, &b"world"[..]), (1, 2, &b"hello "[..])];
        assert_eq!(assemble_icc(&chunks).unwrap(), b"hello world");
        assert!(assemble_icc(&chunks[..1]).is_none());
        assert!(assemble_icc(&[(1, 2, &b"a"[..]), (1, 2, &b"b"[..])]).is_none());
        assert!(assemble_icc(&[]).is_none());
    }

    #[test]
    fn density_to_resolution() {
        let d = |unit, x, y| JfifDensity { unit, x, y };
        assert_eq!(resolution(d(DensityUnit::None, 1, 1)), Some((72.0, 72.0)));
        assert_eq!(resolution(d(DensityUnit::None, 2, 1)), Some((144.0, 72.0)));
        assert_eq!(resolution(d(DensityUnit::None, 1, 0)), None);
        assert_eq!(
            resolution(d(DensityUnit::DotsPerInch, 300, 200)),
            Some((300.0, 200.0))
        );
        let (x, y) = resolution(d(DensityUnit::DotsPerCm, 100, 100)).unwrap();
        assert!((x - 254.0).abs() < 1e-9 && (y - 254.0).abs() < 1e-9);
        assert_eq!(resolution(d(DensityUnit::DotsPerInch, 0, 72)), None);
    }

    #[test]
    fn cmyk_rows() {
        let mut dst = [0; 8];
        store_rows(&[255, 128, 0, 200, 10, 20, 30, 255], 4, true, &mut dst[..6]);
        assert_eq!(&dst[..6], &[200, 100, 0, 10, 20, 30]);

        let mut dst = [0; 4];
        store_rows(&[7, 9], 1, false, &mut dst);
        assert_eq!(dst, [7, 255, 9, 255]);
    }

    #[test]
    fn header_without_frame() {
        let data = [0xFF, 0xD8, 0xFF, 0xD9];
        assert!(read_header(&data).is_err());
        assert!(read_header(b"GIF89a").is_err());
    }
}
