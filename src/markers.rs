//! Writing marker segments and inserting them into an encoded stream.

use std::io::{self, Write};

use crate::{
    error::{Error, Result},
    file::{AppKind, JpegParser, SegmentKind, EXIF_MAGIC, ICC_MAGIC, XMP_MAGIC},
};

pub const SOI: u8 = 0xD8;
pub const APP0: u8 = 0xE0;
pub const APP1: u8 = 0xE1;
pub const APP2: u8 = 0xE2;
pub const COM: u8 = 0xFE;

/// Largest payload a marker segment can carry (the length field counts itself).
pub const MAX_SEGMENT_PAYLOAD: usize = 65533;
/// Largest ICC profile chunk per APP2 segment, after the identifier and sequence bytes.
pub const MAX_ICC_BYTES_PER_MARKER: usize = MAX_SEGMENT_PAYLOAD - ICC_MAGIC.len() - 2;

const JFIF_VERSION: [u8; 2] = [1, 1];

/// JFIF pixel density.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Density {
    /// 0: aspect ratio only, 1: dots per inch, 2: dots per cm.
    pub unit: u8,
    pub x: u16,
    pub y: u16,
}

impl Default for Density {
    fn default() -> Self {
        Self { unit: 0, x: 1, y: 1 }
    }
}

pub struct MarkerWriter<W> {
    output: W,
}

impl<W: Write> MarkerWriter<W> {
    pub fn new(output: W) -> Self {
        Self { output }
    }

    fn emit_byte(&mut self, byte: u8) -> io::Result<()> {
        self.output.write_all(&[byte])
    }

    fn emit_2bytes(&mut self, value: u16) -> io::Result<()> {
        self.output.write_all(&value.to_be_bytes())
    }

    fn emit_marker(&mut self, marker: u8) -> io::Result<()> {
        self.emit_byte(0xFF)?;
        self.emit_byte(marker)
    }

    pub fn write_soi(&mut self) -> io::Result<()> {
        self.emit_marker(SOI)
    }

    pub fn write_jfif_app0(&mut self, density: Density) -> io::Result<()> {
        self.emit_marker(APP0)?;
        // 2 (length) + 5 (identifier) + 2 (version) + 1 (units) + 4 (density) + 2 (thumbnail)
        self.emit_2bytes(16)?;
        self.output.write_all(b"JFIF\0")?;
        self.output.write_all(&JFIF_VERSION)?;
        self.emit_byte(density.unit)?;
        self.emit_2bytes(density.x)?;
        self.emit_2bytes(density.y)?;
        self.emit_byte(0)?;
        self.emit_byte(0)
    }

    /// Writes a complete segment with `payload` as its body.
    pub fn write_segment(&mut self, marker: u8, payload: &[u8]) -> io::Result<()> {
        if payload.len() > MAX_SEGMENT_PAYLOAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "ff {marker:02x} payload of {} bytes does not fit a marker segment",
                    payload.len()
                ),
            ));
        }
        self.emit_marker(marker)?;
        self.emit_2bytes(payload.len() as u16 + 2)?;
        self.output.write_all(payload)
    }

    pub fn write_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.output.write_all(bytes)
    }

    pub fn into_inner(self) -> W {
        self.output
    }
}

/// A segment queued for insertion after the stream header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    pub marker: u8,
    pub payload: Vec<u8>,
}

impl Marker {
    pub fn new(marker: u8, payload: Vec<u8>) -> Self {
        Self { marker, payload }
    }

    /// A COM segment, truncated to the largest payload a segment can hold.
    pub fn comment(text: &str) -> Self {
        let bytes = text.as_bytes();
        let len = bytes.len().min(MAX_SEGMENT_PAYLOAD);
        if len < bytes.len() {
            log::warn!("comment of {} bytes truncated to {len}", bytes.len());
        }
        Self::new(COM, bytes[..len].to_vec())
    }

    pub fn exif(data: &[u8]) -> Self {
        Self::new(APP1, [EXIF_MAGIC, data].concat())
    }

    pub fn xmp(packet: &[u8]) -> Self {
        Self::new(APP1, [XMP_MAGIC, packet].concat())
    }

    /// Splits an ICC profile into numbered APP2 segments.
    pub fn icc_profile(icc: &[u8]) -> Result<Vec<Self>> {
        if icc.is_empty() {
            return Ok(Vec::new());
        }
        let count = icc.len().div_ceil(MAX_ICC_BYTES_PER_MARKER);
        let count = u8::try_from(count).map_err(|_| {
            Error::from(format!(
                "ICC profile of {} bytes is too large to embed",
                icc.len()
            ))
        })?;
        Ok(icc
            .chunks(MAX_ICC_BYTES_PER_MARKER)
            .zip(1..=count)
            .map(|(chunk, seq)| {
                let mut payload = Vec::with_capacity(ICC_MAGIC.len() + 2 + chunk.len());
                payload.extend_from_slice(ICC_MAGIC);
                payload.push(seq);
                payload.push(count);
                payload.extend_from_slice(chunk);
                Self::new(APP2, payload)
            })
            .collect())
    }
}

/// Rebuilds `encoded` with `markers` inserted after its leading APPn segments.
///
/// The encoder's JFIF header is dropped; `jfif` supplies the replacement, if any. Other leading
/// APPn segments (such as the Adobe segment of CMYK streams) are kept.
pub fn splice(encoded: &[u8], jfif: Option<Density>, markers: &[Marker]) -> Result<Vec<u8>> {
    let mut parser = JpegParser::new(encoded)?;
    let mut kept = Vec::new();
    let body_start = loop {
        let Some(segment) = parser.next_segment()? else {
            return Err(Error::from("encoded stream contains no frame"));
        };
        match segment.as_segment_kind() {
            Some(SegmentKind::App(app)) => {
                if !matches!(app.as_app_kind(), Some(AppKind::Jfif(_))) {
                    kept.push(segment.offset()..segment.end());
                }
            }
            _ => break segment.offset(),
        }
    };

    let extra: usize = markers.iter().map(|m| m.payload.len() + 4).sum();
    let mut writer = MarkerWriter::new(Vec::with_capacity(encoded.len() + extra + 18));
    let write = |writer: &mut MarkerWriter<Vec<u8>>| -> io::Result<()> {
        writer.write_soi()?;
        if let Some(density) = jfif {
            writer.write_jfif_app0(density)?;
        }
        for range in &kept {
            writer.write_raw(&encoded[range.clone()])?;
        }
        for m in markers {
            writer.write_segment(m.marker, &m.payload)?;
        }
        writer.write_raw(&encoded[body_start..])
    };
    write(&mut writer).map_err(|e| Error::io("writing markers", e))?;
    Ok(writer.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jfif_app0() {
        let mut writer = MarkerWriter::new(Vec::new());
        writer
            .write_jfif_app0(Density {
                unit: 1,
                x: 300,
                y: 72,
            })
            .unwrap();
        assert_eq!(
            writer.into_inner(),
            [
                0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0, 1, 1, 1, 0x01, 0x2C, 0x00,
                0x48, 0, 0
            ]
        );
    }

    #[test]
    fn oversized_segment() {
        let mut writer = MarkerWriter::new(Vec::new());
        assert!(writer.write_segment(COM, &[0; MAX_SEGMENT_PAYLOAD]).is_ok());
        assert!(writer
            .write_segment(COM, &[0; MAX_SEGMENT_PAYLOAD + 1])
            .is_err());
    }

    #[test]
    fn icc_chunks() {
        let icc: Vec<u8> = (0..MAX_ICC_BYTES_PER_MARKER * 2 + 10)
            .map(|i| i as u8)
            .collect();
        let markers = Marker::icc_profile(&icc).unwrap();
        assert_eq!(markers.len(), 3);
        for (i, m) in markers.iter().enumerate() {
            assert_eq!(m.marker, APP2);
            assert!(m.payload.starts_with(ICC_MAGIC));
            assert_eq!(m.payload[12], i as u8 + 1);
            assert_eq!(m.payload[13], 3);
            assert!(m.payload.len() <= MAX_SEGMENT_PAYLOAD);
        }
        let joined: Vec<u8> = markers.iter().flat_map(|m| m.payload[14..].to_vec()).collect();
        assert_eq!(joined, icc);
        assert!(Marker::icc_profile(&[]).unwrap().is_empty());
    }

    #[test]
    fn splice_replaces_jfif() {
        let encoded = [
            0xFF, 0xD8, // SOI
            0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0, 1, 2, 0, 0, 1, 0, 1, 0, 0, //
            0xFF, 0xEE, 0x00, 0x0E, b'A', b'd', b'o', b'b', b'e', 0, 100, 0, 0, 0, 0, 0, //
            0xFF, 0xDD, 0x00, 0x04, 0x00, 0x00, // DRI
            0xFF, 0xD9, // EOI
        ];
        let out = splice(
            &encoded,
            Some(Density {
                unit: 2,
                x: 28,
                y: 28,
            }),
            &[Marker::comment("hi")],
        )
        .unwrap();

        let mut expected = vec![0xFF, 0xD8];
        expected.extend_from_slice(&[
            0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0, 1, 1, 2, 0, 28, 0, 28, 0, 0,
        ]);
        expected.extend_from_slice(&encoded[20..36]);
        expected.extend_from_slice(&[0xFF, 0xFE, 0x00, 0x04, b'h', b'i']);
        expected.extend_from_slice(&encoded[36..]);
        assert_eq!(out, expected);
    }

    #[test]
    fn splice_without_frame() {
        let encoded = [0xFF, 0xD8, 0xFF, 0xD9];
        assert!(splice(&encoded, None, &[]).is_err());
    }
}
