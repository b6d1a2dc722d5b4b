//! Minimal host-side image model the codec pipelines read from and write into.

use std::{collections::BTreeMap, fmt, rc::Rc};

use crate::error::{Error, Result};

/// The color model of a whole image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseType {
    Rgb,
    Gray,
    Indexed,
}

/// Memory layout of an 8-bit pixel buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Gray,
    GrayA,
    Rgb,
    Rgba,
    Indexed,
    IndexedA,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Gray | Self::Indexed => 1,
            Self::GrayA | Self::IndexedA => 2,
            Self::Rgb => 3,
            Self::Rgba => 4,
        }
    }

    #[inline]
    pub fn has_alpha(self) -> bool {
        matches!(self, Self::GrayA | Self::Rgba | Self::IndexedA)
    }

    #[inline]
    pub fn is_indexed(self) -> bool {
        matches!(self, Self::Indexed | Self::IndexedA)
    }

    #[inline]
    pub fn is_rgb(self) -> bool {
        matches!(self, Self::Rgb | Self::Rgba)
    }

    /// Number of color channels, not counting alpha.
    pub fn color_channels(self) -> usize {
        self.bytes_per_pixel() - usize::from(self.has_alpha())
    }
}

/// Tightly packed 8-bit pixel rows.
pub struct PixelBuffer {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Vec<u8>,
}

impl PixelBuffer {
    /// Creates a zero-filled buffer.
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        let len = width as usize * height as usize * format.bytes_per_pixel();
        Self {
            width,
            height,
            format,
            data: vec![0; len],
        }
    }

    pub fn from_data(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * format.bytes_per_pixel();
        if data.len() != expected {
            return Err(Error::calling(format!(
                "pixel data of {} bytes does not match a {width}x{height} {format:?} buffer ({expected} bytes)",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            format,
            data,
        })
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn rowstride(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    /// Rows `y..y + count`, clipped to the buffer.
    pub fn rows(&self, y: u32, count: u32) -> &[u8] {
        let stride = self.rowstride();
        let start = (y.min(self.height) as usize) * stride;
        let end = (y.saturating_add(count).min(self.height) as usize) * stride;
        &self.data[start..end]
    }

    pub fn rows_mut(&mut self, y: u32, count: u32) -> &mut [u8] {
        let stride = self.rowstride();
        let start = (y.min(self.height) as usize) * stride;
        let end = (y.saturating_add(count).min(self.height) as usize) * stride;
        &mut self.data[start..end]
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PixelBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .finish()
    }
}

/// A drawable: a named pixel buffer. The buffer is shared, so an export holds it by reference.
#[derive(Debug, Clone)]
pub struct Layer {
    name: String,
    buffer: Rc<PixelBuffer>,
}

impl Layer {
    pub fn new(name: impl Into<String>, buffer: PixelBuffer) -> Self {
        Self {
            name: name.into(),
            buffer: Rc::new(buffer),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn buffer(&self) -> &Rc<PixelBuffer> {
        &self.buffer
    }

    #[inline]
    pub fn format(&self) -> PixelFormat {
        self.buffer.format()
    }
}

/// A named blob attached to an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parasite {
    name: String,
    persistent: bool,
    data: Vec<u8>,
}

impl Parasite {
    pub fn new(name: impl Into<String>, persistent: bool, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            persistent,
            data,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the host saves this parasite with the image.
    #[inline]
    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Display units for physical image dimensions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Unit {
    Pixel,
    Inch,
    Millimeter,
    Centimeter,
    Point,
    Pica,
}

impl Unit {
    /// Units per inch (0 for pixels).
    pub fn factor(self) -> f64 {
        match self {
            Self::Pixel => 0.0,
            Self::Inch => 1.0,
            Self::Millimeter => 25.4,
            Self::Centimeter => 2.54,
            Self::Point => 72.0,
            Self::Pica => 6.0,
        }
    }
}

/// An opaque ICC profile. Only the header is inspected.
#[derive(Clone, PartialEq, Eq)]
pub struct ColorProfile {
    icc: Vec<u8>,
}

impl ColorProfile {
    const HEADER_LEN: usize = 128;

    /// Wraps ICC bytes. Returns `None` when the data is too short to hold a profile header.
    pub fn from_icc(icc: Vec<u8>) -> Option<Self> {
        (icc.len() >= Self::HEADER_LEN).then_some(Self { icc })
    }

    #[inline]
    pub fn icc(&self) -> &[u8] {
        &self.icc
    }

    /// The data color space signature from the profile header (bytes 16..20).
    pub fn color_space_signature(&self) -> [u8; 4] {
        let mut sig = [0; 4];
        sig.copy_from_slice(&self.icc[16..20]);
        sig
    }

    pub fn is_cmyk(&self) -> bool {
        &self.color_space_signature() == b"CMYK"
    }

    pub fn is_gray(&self) -> bool {
        &self.color_space_signature() == b"GRAY"
    }

    pub fn is_rgb(&self) -> bool {
        &self.color_space_signature() == b"RGB "
    }

    /// A short human-readable label, e.g. `CMYK profile (560 bytes)`.
    pub fn label(&self) -> String {
        let sig = self.color_space_signature();
        format!(
            "{} profile ({} bytes)",
            String::from_utf8_lossy(&sig).trim_end(),
            self.icc.len()
        )
    }
}

impl fmt::Debug for ColorProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// An image document: layers plus the metadata a file format can round-trip.
#[derive(Debug)]
pub struct Image {
    width: u32,
    height: u32,
    base_type: BaseType,
    layers: Vec<Layer>,
    resolution: (f64, f64),
    unit: Unit,
    parasites: BTreeMap<String, Parasite>,
    color_profile: Option<ColorProfile>,
    simulation_profile: Option<ColorProfile>,
}

/// Resolution of a new image, in pixels per inch.
pub const DEFAULT_RESOLUTION: f64 = 72.0;

impl Image {
    pub fn new(width: u32, height: u32, base_type: BaseType) -> Self {
        Self {
            width,
            height,
            base_type,
            layers: Vec::new(),
            resolution: (DEFAULT_RESOLUTION, DEFAULT_RESOLUTION),
            unit: Unit::Inch,
            parasites: BTreeMap::new(),
            color_profile: None,
            simulation_profile: None,
        }
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn base_type(&self) -> BaseType {
        self.base_type
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Adds a layer on top of the stack.
    pub fn insert_layer(&mut self, layer: Layer) {
        self.layers.insert(0, layer);
    }

    /// Removes the first layer with this name, returning it.
    pub fn remove_layer(&mut self, name: &str) -> Option<Layer> {
        let index = self.layers.iter().position(|l| l.name() == name)?;
        Some(self.layers.remove(index))
    }

    /// Horizontal and vertical resolution in pixels per inch.
    #[inline]
    pub fn resolution(&self) -> (f64, f64) {
        self.resolution
    }

    pub fn set_resolution(&mut self, x: f64, y: f64) {
        self.resolution = (x, y);
    }

    #[inline]
    pub fn unit(&self) -> Unit {
        self.unit
    }

    pub fn set_unit(&mut self, unit: Unit) {
        self.unit = unit;
    }

    pub fn parasite(&self, name: &str) -> Option<&Parasite> {
        self.parasites.get(name)
    }

    pub fn attach_parasite(&mut self, parasite: Parasite) {
        self.parasites.insert(parasite.name.clone(), parasite);
    }

    pub fn detach_parasite(&mut self, name: &str) -> Option<Parasite> {
        self.parasites.remove(name)
    }

    pub fn parasites(&self) -> impl Iterator<Item = &Parasite> {
        self.parasites.values()
    }

    #[inline]
    pub fn color_profile(&self) -> Option<&ColorProfile> {
        self.color_profile.as_ref()
    }

    pub fn set_color_profile(&mut self, profile: Option<ColorProfile>) {
        self.color_profile = profile;
    }

    /// The soft-proofing profile, used as the target of CMYK exports.
    #[inline]
    pub fn simulation_profile(&self) -> Option<&ColorProfile> {
        self.simulation_profile.as_ref()
    }

    pub fn set_simulation_profile(&mut self, profile: Option<ColorProfile>) {
        self.simulation_profile = profile;
    }
}

/// Receives progress reports from long-running import and export runs.
pub trait Progress {
    fn init(&mut self, message: &str);
    /// `fraction` is in `0.0..=1.0`.
    fn update(&mut self, fraction: f64);
}

/// A [`Progress`] that discards all reports.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl Progress for NoProgress {
    fn init(&mut self, _: &str) {}
    fn update(&mut self, _: f64) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_are_clipped() {
        let buf = PixelBuffer::new(3, 4, PixelFormat::Rgba);
        assert_eq!(buf.rowstride(), 12);
        assert_eq!(buf.rows(0, 2).len(), 24);
        assert_eq!(buf.rows(3, 64).len(), 12);
        assert!(buf.rows(4, 1).is_empty());
    }

    #[test]
    fn from_data_checks_size() {
        assert!(PixelBuffer::from_data(2, 2, PixelFormat::Gray, vec![0; 4]).is_ok());
        let err = PixelBuffer::from_data(2, 2, PixelFormat::Rgb, vec![0; 4]).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Calling);
    }

    #[test]
    fn profile_header() {
        let mut icc = vec![0; 128];
        icc[16..20].copy_from_slice(b"CMYK");
        let profile = ColorProfile::from_icc(icc).unwrap();
        assert!(profile.is_cmyk());
        assert!(!profile.is_rgb());
        assert_eq!(profile.label(), "CMYK profile (128 bytes)");
        assert!(ColorProfile::from_icc(vec![0; 20]).is_none());
    }

    #[test]
    fn format_channels() {
        assert_eq!(PixelFormat::Rgba.color_channels(), 3);
        assert_eq!(PixelFormat::GrayA.color_channels(), 1);
        assert!(PixelFormat::IndexedA.is_indexed());
    }
}
