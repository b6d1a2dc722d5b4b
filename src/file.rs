//! JPEG/JFIF marker segment parser.
//!
//! Only marker segments are decoded. Entropy-coded scan data is skipped lazily: it is stepped over
//! when the segment following a scan is requested, so callers that stop at the first scan header
//! never look at it.

#![allow(non_snake_case, dead_code)]


use std::{fmt, mem};

use bytemuck::{AnyBitPattern, Pod, Zeroable};

use crate::{
    error::{Error, Result},
    metadata::QuantTable,
};

/// Identifier at the start of an APP1 segment carrying EXIF data.
pub(crate) const EXIF_MAGIC: &[u8] = b"Exif\0\0";
/// Identifier at the start of an APP1 segment carrying an XMP packet.
pub(crate) const XMP_MAGIC: &[u8] = b"http://ns.adobe.com/xap/1.0/\0";
/// Identifier at the start of an APP2 segment carrying a chunk of an ICC profile.
pub(crate) const ICC_MAGIC: &[u8] = b"ICC_PROFILE\0";
const JFIF_MAGIC: &[u8] = b"JFIF\0";
const ADOBE_MAGIC: &[u8] = b"Adobe";

pub struct JpegParser<'a> {
    reader: Reader<'a>,
    /// Set after an SOS header; the entropy-coded data behind it has not been skipped yet.
    in_scan: bool,
}

impl<'a> JpegParser<'a> {
    pub fn new(buf: &'a [u8]) -> Result<Self> {
        let mut reader = Reader { buf, position: 0 };
        if reader.read_u8()? != 0xFF || reader.read_u8()? != 0xD8 {
            return Err(Error::from("Not a JPEG file: starts with no SOI marker"));
        }
        Ok(Self {
            reader,
            in_scan: false,
        })
    }

    /// Reads the next [`Segment`] from the JPEG data.
    ///
    /// `SOI`/`EOI` are handled internally and never returned. Returns `Ok(None)` at the EOI
    /// marker; data after it can be retrieved with [`JpegParser::remaining`].
    pub fn next_segment(&mut self) -> Result<Option<Segment<'a>>> {
        if self.in_scan {
            self.skip_scan_data()?;
            self.in_scan = false;
        }

        while self.reader.read_u8()? != 0xff {}
        let mut marker = self.reader.read_u8()?;
        // Any number of fill bytes may precede a marker.
        while marker == 0xff {
            marker = self.reader.read_u8()?;
        }
        let segment_offset = self.reader.position - 2;

        if marker == 0x00 {
            return Err(Error::from("invalid ff 00 marker"));
        }

        if marker == 0xD9 {
            if !self.reader.remaining().is_empty() {
                log::warn!(
                    "ignoring {} trailing bytes after EOI",
                    self.reader.remaining().len()
                );
            }

            return Ok(None);
        }

        // SOI is read in `new`, EOI is handled above and RSTn only occurs inside scan data. Every
        // remaining marker (even an unknown one) is followed by the segment length.

        let length = usize::from(self.reader.read_length()?);
        let body_start = self.reader.position;
        let expected_end = body_start + length;
        let mut reader = Reader {
            buf: &self.reader.buf[..expected_end],
            position: body_start,
        };
        let kind = match marker {
            0xDB => Some(SegmentKind::Dqt(read_dqt(&mut reader)?)),
            0xC0..=0xC3 | 0xC5..=0xC7 | 0xC9..=0xCB | 0xCD..=0xCF => {
                Some(SegmentKind::Sof(read_sof(marker, &mut reader)?))
            }
            0xDA => {
                self.in_scan = true;
                Some(SegmentKind::Sos(read_sos(&mut reader)?))
            }
            0xDD => Some(SegmentKind::Dri(read_dri(&mut reader)?)),
            0xE0..=0xEF => Some(SegmentKind::App(read_app(marker, &mut reader)?)),
            0xFE => Some(SegmentKind::Com(Com {
                com: reader.read_slice(reader.remaining().len())?,
            })),
            _ => {
                log::trace!("skipping ff {marker:02x} segment ({length} bytes)");
                reader.position = expected_end;
                None
            }
        };

        if reader.position < expected_end {
            let remaining = expected_end - reader.position;
            log::warn!(
                "ff {:02x} segment specified a length of {} bytes, but {} remain after decoding",
                marker,
                length,
                remaining,
            );
        }
        self.reader.position = expected_end;

        Ok(Some(Segment {
            marker,
            raw_bytes: &self.reader.buf[body_start..expected_end],
            offset: segment_offset,
            kind,
        }))
    }

    /// Returns the remaining (unparsed) bytes of the input data.
    ///
    /// After an SOS segment this starts with the entropy-coded data of that scan.
    pub fn remaining(&self) -> &'a [u8] {
        self.reader.remaining()
    }

    /// Advances to the `0xFF` byte introducing the first marker after the scan data, stepping over
    /// stuffed zero bytes and `RSTn` markers.
    fn skip_scan_data(&mut self) -> Result<()> {
        loop {
            while self.reader.peek_u8(0)? != 0xff {
                self.reader.position += 1;
            }

            let mut offset = 1;
            let mut byte = self.reader.peek_u8(offset)?;
            while byte == 0xff {
                offset += 1;
                byte = self.reader.peek_u8(offset)?;
            }

            match byte {
                0x00 | 0xD0..=0xD7 => self.reader.position += offset + 1,
                _ => {
                    self.reader.position += offset - 1;
                    return Ok(());
                }
            }
        }
    }
}

fn read_dqt(reader: &mut Reader<'_>) -> Result<Dqt> {
    let mut tables = Vec::new();
    while !reader.remaining().is_empty() {
        let PqTq = reader.read_u8()?;
        let Pq = PqTq >> 4;
        let Tq = PqTq & 0xf;
        if Tq > 3 {
            return Err(Error::from(format!(
                "quantization table destination {Tq} out of range"
            )));
        }
        let mut zigzag = [0u16; 64];
        match Pq {
            0 => {
                for (dst, &src) in zigzag.iter_mut().zip(reader.read_slice(64)?) {
                    *dst = src.into();
                }
            }
            1 => {
                for dst in &mut zigzag {
                    *dst = reader.read_u16()?;
                }
            }
            _ => {
                return Err(Error::from(format!(
                    "invalid quantization table precision {Pq}"
                )))
            }
        }
        tables.push(QuantizationTable {
            Pq,
            Tq,
            table: QuantTable::from_zigzag(&zigzag),
        });
    }
    Ok(Dqt(tables))
}

fn read_sof<'a>(sof: u8, reader: &mut Reader<'a>) -> Result<Sof<'a>> {
    let P = reader.read_u8()?;
    let Y = reader.read_u16()?;
    let X = reader.read_u16()?;
    let num_components = reader.read_u8()?;
    let components = reader.read_objs::<FrameComponent>(num_components.into())?;
    Ok(Sof {
        sof: SofMarker(sof),
        P,
        Y,
        X,
        components,
    })
}

fn read_sos<'a>(reader: &mut Reader<'a>) -> Result<Sos<'a>> {
    let num_components = reader.read_u8()?;
    let components = reader.read_objs(num_components.into())?;
    let Ss = reader.read_u8()?;
    let Se = reader.read_u8()?;
    let AhAl = reader.read_u8()?;
    Ok(Sos {
        components,
        Ss,
        Se,
        AhAl,
    })
}

fn read_dri(reader: &mut Reader<'_>) -> Result<Dri> {
    Ok(Dri {
        Ri: reader.read_u16()?,
    })
}

fn read_app<'a>(marker: u8, reader: &mut Reader<'a>) -> Result<App<'a>> {
    let n = marker - 0xE0;
    let payload = reader.remaining();

    let kind = match n {
        0 if payload.starts_with(JFIF_MAGIC) => {
            reader.position += JFIF_MAGIC.len();
            match read_jfif(reader) {
                Ok(jfif) => Some(AppKind::Jfif(jfif)),
                Err(e) => {
                    log::warn!("ignoring truncated JFIF segment: {e}");
                    None
                }
            }
        }
        1 if payload.starts_with(EXIF_MAGIC) => Some(AppKind::Exif(&payload[EXIF_MAGIC.len()..])),
        1 if payload.starts_with(XMP_MAGIC) => Some(AppKind::Xmp(&payload[XMP_MAGIC.len()..])),
        2 if payload.starts_with(ICC_MAGIC) => match &payload[ICC_MAGIC.len()..] {
            [seq, count, data @ ..] => Some(AppKind::Icc(IccChunk {
                seq: *seq,
                count: *count,
                data,
            })),
            _ => {
                log::warn!("ignoring ICC profile chunk without sequence header");
                None
            }
        },
        14 if payload.starts_with(ADOBE_MAGIC) && payload.len() >= 12 => {
            Some(AppKind::Adobe(Adobe {
                version: u16::from_be_bytes([payload[5], payload[6]]),
                transform: payload[11],
            }))
        }
        _ => None,
    };

    // APP segments carry arbitrary data; consume all of it so no length warning is logged.
    reader.position = reader.buf.len();

    Ok(App { n, kind })
}

fn read_jfif<'a>(reader: &mut Reader<'a>) -> Result<Jfif<'a>> {
    let major_version = reader.read_u8()?;
    let minor_version = reader.read_u8()?;
    let unit = match reader.read_u8()? {
        0 => DensityUnit::None,
        1 => DensityUnit::DotsPerInch,
        2 => DensityUnit::DotsPerCm,
        e => DensityUnit::Unknown(e),
    };
    let xdensity = reader.read_u16()?;
    let ydensity = reader.read_u16()?;
    let xthumbnail = reader.read_u8()?;
    let ythumbnail = reader.read_u8()?;
    let thumbnail_len = usize::from(xthumbnail) * usize::from(ythumbnail) * 3;
    let thumbnail = match reader.read_slice(thumbnail_len) {
        Ok(thumbnail) => thumbnail,
        Err(_) => {
            log::warn!("JFIF thumbnail of {xthumbnail}x{ythumbnail} does not fit its segment");
            &[]
        }
    };
    Ok(Jfif {
        major_version,
        minor_version,
        unit,
        xdensity,
        ydensity,
        xthumbnail,
        ythumbnail,
        thumbnail,
    })
}

#[derive(Debug)]
struct Reader<'a> {
    buf: &'a [u8],
    position: usize,
}

fn eof() -> Error {
    Error::from("reached end of data while decoding JPEG stream")
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> &'a [u8] {
        &self.buf[self.position.min(self.buf.len())..]
    }

    fn peek_u8(&self, offset: usize) -> Result<u8> {
        self.buf.get(self.position + offset).copied().ok_or_else(eof)
    }

    fn read_u8(&mut self) -> Result<u8> {
        let byte = self.peek_u8(0)?;
        self.position += 1;
        Ok(byte)
    }

    fn read_u16(&mut self) -> Result<u16> {
        let b = [self.read_u8()?, self.read_u8()?];
        Ok(u16::from_be_bytes(b))
    }

    fn read_slice(&mut self, count: usize) -> Result<&'a [u8]> {
        let slice = self.remaining().get(..count).ok_or_else(eof)?;
        self.position += count;
        Ok(slice)
    }

    fn read_objs<T: AnyBitPattern>(&mut self, count: usize) -> Result<&'a [T]> {
        debug_assert_eq!(mem::align_of::<T>(), 1);

        let bytes = self.read_slice(count * mem::size_of::<T>())?;
        Ok(bytemuck::cast_slice(bytes))
    }

    fn read_length(&mut self) -> Result<u16> {
        // The length parameter counts itself but not the FF xx marker.
        let len = self.read_u16()?;
        if len < 2 {
            return Err(Error::from(format!("invalid segment length {len}")));
        }
        if self.remaining().len() < (len - 2).into() {
            return Err(eof());
        }
        Ok(len - 2)
    }
}

/// A segment of a JPEG file, introduced by a `0xFF 0xXX` marker.
#[derive(Debug)]
pub struct Segment<'a> {
    marker: u8,
    raw_bytes: &'a [u8],
    offset: usize,
    kind: Option<SegmentKind<'a>>,
}

impl<'a> Segment<'a> {
    /// Returns the offset of the segment's `0xFF 0xXX` marker in the input buffer.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Returns the `0xXX` byte of the marker, which identifies the type of the segment.
    #[inline]
    pub fn marker(&self) -> u8 {
        self.marker
    }

    /// The raw bytes making up this segment, excluding the marker and the length field.
    ///
    /// For an SOS segment this does not include any of the entropy-coded data following it.
    #[inline]
    pub fn raw_bytes(&self) -> &'a [u8] {
        self.raw_bytes
    }

    /// Offset of the first byte after this segment.
    #[inline]
    pub fn end(&self) -> usize {
        self.offset + 4 + self.raw_bytes.len()
    }

    #[inline]
    pub fn as_segment_kind(&self) -> Option<&SegmentKind<'a>> {
        self.kind.as_ref()
    }
}

/// An application-specific segment (`APPn`).
#[derive(Debug)]
pub struct App<'a> {
    n: u8,
    kind: Option<AppKind<'a>>,
}

impl<'a> App<'a> {
    #[inline]
    pub fn as_app_kind(&self) -> Option<&AppKind<'a>> {
        self.kind.as_ref()
    }
}

/// The `APPn` payloads recognized by their identifier string.
#[derive(Debug)]
#[non_exhaustive]
pub enum AppKind<'a> {
    Jfif(Jfif<'a>),
    /// TIFF-structured EXIF data, without the `Exif\0\0` identifier.
    Exif(&'a [u8]),
    /// An XMP packet, without the namespace identifier.
    Xmp(&'a [u8]),
    Icc(IccChunk<'a>),
    Adobe(Adobe),
}

#[derive(Debug)]
pub struct Jfif<'a> {
    major_version: u8,
    minor_version: u8,
    unit: DensityUnit,
    xdensity: u16,
    ydensity: u16,
    xthumbnail: u8,
    ythumbnail: u8,
    thumbnail: &'a [u8],
}

impl<'a> Jfif<'a> {
    #[inline]
    pub fn unit(&self) -> DensityUnit {
        self.unit
    }

    #[inline]
    pub fn density_x(&self) -> u16 {
        self.xdensity
    }

    #[inline]
    pub fn density_y(&self) -> u16 {
        self.ydensity
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DensityUnit {
    /// Only the pixel aspect ratio is given.
    None,
    DotsPerInch,
    DotsPerCm,
    Unknown(u8),
}

/// One chunk of an ICC profile split across APP2 segments.
pub struct IccChunk<'a> {
    seq: u8,
    count: u8,
    data: &'a [u8],
}

impl<'a> IccChunk<'a> {
    /// 1-based sequence number of this chunk.
    #[inline]
    pub fn seq(&self) -> u8 {
        self.seq
    }

    /// Total number of chunks.
    #[inline]
    pub fn count(&self) -> u8 {
        self.count
    }

    #[inline]
    pub fn data(&self) -> &'a [u8] {
        self.data
    }
}

impl<'a> fmt::Debug for IccChunk<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IccChunk")
            .field("seq", &self.seq)
            .field("count", &self.count)
            .field("len", &self.data.len())
            .finish()
    }
}

/// The APP14 segment written by Adobe products.
#[derive(Debug, Clone, Copy)]
pub struct Adobe {
    version: u16,
    transform: u8,
}

impl Adobe {
    /// Color transform applied by the encoder: 0 none (RGB or CMYK), 1 YCbCr, 2 YCCK.
    #[inline]
    pub fn transform(&self) -> u8 {
        self.transform
    }
}

pub struct Com<'a> {
    com: &'a [u8],
}

impl<'a> Com<'a> {
    #[inline]
    pub fn bytes(&self) -> &'a [u8] {
        self.com
    }
}

impl<'a> fmt::Debug for Com<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Com(\"{}\")", self.com.escape_ascii())
    }
}

/// Enumeration of segment kinds understood by this parser.
#[derive(Debug)]
#[non_exhaustive]
pub enum SegmentKind<'a> {
    Dqt(Dqt),
    Dri(Dri),
    Sof(Sof<'a>),
    Sos(Sos<'a>),
    App(App<'a>),
    Com(Com<'a>),
}

#[derive(Clone, Copy)]
pub struct QuantizationTable {
    Pq: u8,
    Tq: u8,
    table: QuantTable,
}

impl QuantizationTable {
    /// Returns the destination identifier (0-3).
    #[inline]
    pub fn Tq(&self) -> u8 {
        self.Tq
    }

    /// Returns the table in natural order.
    #[inline]
    pub fn table(&self) -> &QuantTable {
        &self.table
    }
}

impl fmt::Debug for QuantizationTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuantizationTable")
            .field("Pq", &self.Pq)
            .field("Tq", &self.Tq)
            .field("sum", &self.table.sum())
            .finish()
    }
}

/// **D**efine **Q**uantization **T**ables – sets one or more [`QuantizationTable`]s.
#[derive(Debug)]
pub struct Dqt(Vec<QuantizationTable>);

impl Dqt {
    #[inline]
    pub fn tables(&self) -> impl Iterator<Item = &QuantizationTable> {
        self.0.iter()
    }
}

/// **D**efine **R**estart **I**nterval.
#[derive(Clone, Copy)]
pub struct Dri {
    Ri: u16,
}

impl Dri {
    /// Returns the number of MCUs contained in each restart interval (0 disables them).
    #[inline]
    pub fn Ri(&self) -> u16 {
        self.Ri
    }
}

impl fmt::Debug for Dri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dri").field("Ri", &self.Ri).finish()
    }
}

/// **SOF** Start Of Frame
#[derive(Debug)]
pub struct Sof<'a> {
    sof: SofMarker,
    P: u8,
    Y: u16,
    X: u16,
    components: &'a [FrameComponent],
}

impl<'a> Sof<'a> {
    #[inline]
    pub fn sof(&self) -> SofMarker {
        self.sof
    }

    /// Returns the sample precision in bits.
    #[inline]
    pub fn P(&self) -> u8 {
        self.P
    }

    /// Returns the number of lines in the image (the height of the frame).
    #[inline]
    pub fn Y(&self) -> u16 {
        self.Y
    }

    /// Returns the number of samples per line (the width of the frame).
    #[inline]
    pub fn X(&self) -> u16 {
        self.X
    }

    #[inline]
    pub fn components(&self) -> &'a [FrameComponent] {
        self.components
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SofMarker(u8);

impl fmt::Debug for SofMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::SOF0 => f.write_str("SOF0"),
            Self::SOF1 => f.write_str("SOF1"),
            Self::SOF2 => f.write_str("SOF2"),
            Self::SOF3 => f.write_str("SOF3"),
            Self::SOF9 => f.write_str("SOF9"),
            Self::SOF10 => f.write_str("SOF10"),
            _ => f
                .debug_tuple("SofMarker")
                .field(&format_args!("{:02x}", self.0))
                .finish(),
        }
    }
}

impl SofMarker {
    /// Baseline DCT.
    pub const SOF0: Self = Self(0xC0);
    /// Extended sequential DCT.
    pub const SOF1: Self = Self(0xC1);
    /// Progressive DCT.
    pub const SOF2: Self = Self(0xC2);
    /// Lossless sequential.
    pub const SOF3: Self = Self(0xC3);
    /// Extended sequential DCT, arithmetic coding.
    pub const SOF9: Self = Self(0xC9);
    /// Progressive DCT, arithmetic coding.
    pub const SOF10: Self = Self(0xCA);
}

#[derive(Clone, Copy, Zeroable, Pod)]
#[repr(C)]
pub struct FrameComponent {
    Ci: u8,
    HiVi: u8,
    Tqi: u8,
}

impl FrameComponent {
    /// Returns this component's identifier, which scan headers refer to.
    #[inline]
    pub fn Ci(&self) -> u8 {
        self.Ci
    }

    /// Returns the horizontal sampling factor for this component.
    #[inline]
    pub fn Hi(&self) -> u8 {
        self.HiVi >> 4
    }

    /// Returns the vertical sampling factor for this component.
    #[inline]
    pub fn Vi(&self) -> u8 {
        self.HiVi & 0xf
    }

    /// Returns the index of the quantization table used by this component (0-3).
    #[inline]
    pub fn Tqi(&self) -> u8 {
        self.Tqi
    }
}

impl fmt::Debug for FrameComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameComponent")
            .field("Ci", &self.Ci)
            .field("Hi", &self.Hi())
            .field("Vi", &self.Vi())
            .field("Tqi", &self.Tqi)
            .finish()
    }
}

/// **SOS** Start Of Scan – a scan header; the entropy-coded data follows it.
pub struct Sos<'a> {
    components: &'a [ScanComponent],
    Ss: u8,
    Se: u8,
    AhAl: u8,
}

impl<'a> Sos<'a> {
    #[inline]
    pub fn components(&self) -> &'a [ScanComponent] {
        self.components
    }

    #[inline]
    pub fn Ah(&self) -> u8 {
        self.AhAl >> 4
    }

    #[inline]
    pub fn Al(&self) -> u8 {
        self.AhAl & 0xf
    }
}

impl<'a> fmt::Debug for Sos<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sos")
            .field("components", &self.components)
            .field("Ss", &self.Ss)
            .field("Se", &self.Se)
            .field("Ah", &self.Ah())
            .field("Al", &self.Al())
            .finish()
    }
}

#[derive(Clone, Copy, AnyBitPattern)]
#[repr(C)]
pub struct ScanComponent {
    Csj: u8,
    TdjTaj: u8,
}

impl ScanComponent {
    /// Returns the DC entropy coding table destination selector.
    #[inline]
    pub fn Tdj(&self) -> u8 {
        self.TdjTaj >> 4
    }

    /// Returns the AC entropy coding table destination selector.
    #[inline]
    pub fn Taj(&self) -> u8 {
        self.TdjTaj & 0xf
    }
}

impl fmt::Debug for ScanComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanComponent")
            .field("Csj", &self.Csj)
            .field("Tdj", &self.Tdj())
            .field("Taj", &self.Taj())
            .finish()
    }
}
