use core::fmt;

use bytemuck::{Pod, Zeroable};

/// Maps a zigzag (stream) position to its natural (row-major) position in the 8x8 block.
pub(crate) const NATURAL_ORDER: [usize; 64] = [
    0, 1, 8, 16, 9, 2, 3, 10, //
    17, 24, 32, 25, 18, 11, 4, 5, //
    12, 19, 26, 33, 40, 48, 41, 34, //
    27, 20, 13, 6, 7, 14, 21, 28, //
    35, 42, 49, 56, 57, 50, 43, 36, //
    29, 22, 15, 23, 30, 37, 44, 51, //
    58, 59, 52, 45, 38, 31, 39, 46, //
    53, 60, 61, 54, 47, 55, 62, 63, //
];

/// A quantization table: 64 divisors in natural (row-major) order.
#[derive(Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct QuantTable {
    pub values: [u16; 64],
}

impl QuantTable {
    pub const fn new(values: [u16; 64]) -> Self {
        Self { values }
    }

    /// Builds a table from values stored in zigzag order, as found in a DQT segment.
    pub fn from_zigzag(zigzag: &[u16; 64]) -> Self {
        let mut values = [0; 64];
        for (k, &v) in zigzag.iter().enumerate() {
            values[NATURAL_ORDER[k]] = v;
        }
        Self { values }
    }

    pub fn to_zigzag(&self) -> [u16; 64] {
        let mut out = [0; 64];
        for (k, v) in out.iter_mut().enumerate() {
            *v = self.values[NATURAL_ORDER[k]];
        }
        out
    }

    /// Sum of all 64 divisors.
    pub fn sum(&self) -> u32 {
        self.values.iter().map(|&v| u32::from(v)).sum()
    }

    pub fn max(&self) -> u16 {
        self.values.iter().copied().max().unwrap_or(0)
    }

    /// Returns the table with its 8x8 grid mirrored across the main diagonal.
    pub fn transposed(&self) -> Self {
        let mut values = [0; 64];
        for i in 0..8 {
            for j in 0..8 {
                values[i * 8 + j] = self.values[j * 8 + i];
            }
        }
        Self { values }
    }

    /// Rows of the table, top to bottom.
    pub fn rows(&self) -> impl Iterator<Item = &[u16]> {
        self.values.chunks_exact(8)
    }
}

impl fmt::Debug for QuantTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.rows()).finish()
    }
}

/// Up to 4 quantization table slots, indexed by the table destination `Tq` (0-3).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct QuantizationTableSet {
    slots: [Option<QuantTable>; 4],
}

impl QuantizationTableSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, slot: usize, table: QuantTable) {
        self.slots[slot] = Some(table);
    }

    #[inline]
    pub fn get(&self, slot: usize) -> Option<&QuantTable> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    /// Number of slots holding a table.
    pub fn count(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    /// The present tables in slot order, skipping empty slots.
    pub fn present(&self) -> impl Iterator<Item = &QuantTable> {
        self.slots.iter().flatten()
    }

    pub fn slots(&self) -> &[Option<QuantTable>; 4] {
        &self.slots
    }
}

impl FromIterator<QuantTable> for QuantizationTableSet {
    fn from_iter<T: IntoIterator<Item = QuantTable>>(iter: T) -> Self {
        let mut set = Self::new();
        for (slot, table) in iter.into_iter().take(4).enumerate() {
            set.set(slot, table);
        }
        set
    }
}

/// JPEG color spaces, numbered like libjpeg's `J_COLOR_SPACE` (the numbering is persisted).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ColorSpace {
    Unknown = 0,
    Grayscale = 1,
    Rgb = 2,
    YCbCr = 3,
    Cmyk = 4,
    Ycck = 5,
}

impl ColorSpace {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Grayscale,
            2 => Self::Rgb,
            3 => Self::YCbCr,
            4 => Self::Cmyk,
            5 => Self::Ycck,
            _ => Self::Unknown,
        }
    }

    #[inline]
    pub fn is_cmyk(self) -> bool {
        matches!(self, Self::Cmyk | Self::Ycck)
    }
}

/// Horizontal and vertical sampling factors of one frame component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sampling {
    pub h: u8,
    pub v: u8,
}

impl Sampling {
    pub const ONE: Self = Self { h: 1, v: 1 };

    pub const fn new(h: u8, v: u8) -> Self {
        Self { h, v }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zigzag_round_trip() {
        let mut zigzag = [0u16; 64];
        for (i, v) in zigzag.iter_mut().enumerate() {
            *v = i as u16;
        }
        let table = QuantTable::from_zigzag(&zigzag);
        // Second zigzag entry is the horizontal neighbour of DC, third the vertical one.
        assert_eq!(table.values[1], 1);
        assert_eq!(table.values[8], 2);
        assert_eq!(table.values[63], 63);
        assert_eq!(table.to_zigzag(), zigzag);
    }

    #[test]
    fn transpose() {
        let mut values = [0u16; 64];
        values[1] = 7;
        let table = QuantTable::new(values);
        let t = table.transposed();
        assert_eq!(t.values[8], 7);
        assert_eq!(t.values[1], 0);
        assert_eq!(t.transposed(), table);
    }

    #[test]
    fn table_set_counts_present_slots() {
        let mut set = QuantizationTableSet::new();
        assert_eq!(set.count(), 0);
        set.set(0, QuantTable::new([1; 64]));
        set.set(2, QuantTable::new([2; 64]));
        assert_eq!(set.count(), 2);
        assert!(set.get(1).is_none());
        assert_eq!(set.present().map(QuantTable::sum).collect::<Vec<_>>(), [64, 128]);
    }
}
