//! Export parameters, their persisted defaults, and the rules coupling them to the original
//! file's settings.

use std::fmt::Write;

use crate::{
    image::{Image, Parasite},
    metadata::Sampling,
    settings::{self, RestoredSettings},
};

/// Name of the parasite holding the last used export parameters.
pub const DEFAULTS_PARASITE: &str = "jpeg-save-options";
/// Name of the parasite holding the image comment.
pub const COMMENT_PARASITE: &str = "gimp-comment";

/// Restart interval offered when restart markers are switched on without an interval.
pub const DEFAULT_RESTART_MCU_ROWS: u32 = 16;

/// Chroma subsampling layouts for YCbCr output.
///
/// The discriminants are the persisted identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubsamplingMode {
    /// 4:2:0, chroma quartered (luma 2x2).
    Chroma420 = 0,
    /// 4:2:2 horizontal, chroma halved (luma 2x1).
    Chroma422Horizontal = 1,
    /// 4:4:4, no subsampling.
    Chroma444 = 2,
    /// 4:2:2 vertical, chroma halved (luma 1x2).
    Chroma422Vertical = 3,
}

impl SubsamplingMode {
    pub const ALL: [Self; 4] = [
        Self::Chroma420,
        Self::Chroma422Horizontal,
        Self::Chroma444,
        Self::Chroma422Vertical,
    ];

    pub fn from_id(id: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|m| *m as i32 == id)
    }

    #[inline]
    pub fn id(self) -> i32 {
        self as i32
    }

    /// Sampling factors of the luma component; both chroma components are always 1x1.
    pub fn luma_sampling(self) -> Sampling {
        match self {
            Self::Chroma420 => Sampling::new(2, 2),
            Self::Chroma422Horizontal => Sampling::new(2, 1),
            Self::Chroma444 => Sampling::new(1, 1),
            Self::Chroma422Vertical => Sampling::new(1, 2),
        }
    }

    /// Per-component sampling factors for a YCbCr frame.
    pub fn component_sampling(self) -> [Sampling; 3] {
        [self.luma_sampling(), Sampling::ONE, Sampling::ONE]
    }

    /// The canonical mode matching a luma sampling factor pair.
    pub fn from_luma_sampling(luma: Sampling) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.luma_sampling() == luma)
    }

    /// The two modes with unequal horizontal and vertical factors, which smoothing does not
    /// support.
    #[inline]
    pub fn is_asymmetric(self) -> bool {
        matches!(self, Self::Chroma422Horizontal | Self::Chroma422Vertical)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Chroma420 => "4:2:0 (chroma quartered)",
            Self::Chroma422Horizontal => "4:2:2 horizontal (chroma halved)",
            Self::Chroma444 => "4:4:4 (best quality)",
            Self::Chroma422Vertical => "4:2:2 vertical (chroma halved)",
        }
    }
}

/// Forward DCT implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DctMethod {
    /// Accurate integer transform.
    IntegerSlow = 0,
    IntegerFast = 1,
    Float = 2,
}

impl DctMethod {
    pub fn from_id(id: i32) -> Self {
        match id {
            1 => Self::IntegerFast,
            2 => Self::Float,
            _ => Self::IntegerSlow,
        }
    }
}

/// All user-tunable export parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportConfig {
    /// Quality fraction in `0.0..=1.0`.
    pub quality: f64,
    /// Smoothing strength in `0.0..=1.0`.
    pub smoothing: f64,
    pub optimize: bool,
    /// Arithmetic coding; takes precedence over `optimize`.
    pub arithmetic: bool,
    pub progressive: bool,
    /// Keep quantization tables 8-bit.
    pub baseline: bool,
    pub cmyk: bool,
    pub subsampling: SubsamplingMode,
    /// Restart interval in MCU rows, 0 disables restart markers.
    pub restart: u32,
    pub dct: DctMethod,
    pub include_profile: bool,
    pub include_comment: bool,
    pub comment: Option<String>,
    pub include_exif: bool,
    pub include_xmp: bool,
    pub show_preview: bool,

    /// Reuse the quantization tables of the file the image was loaded from.
    pub use_original_quality: bool,
    /// Quality recovered from the original file, 0 when unknown.
    pub original_quality: i32,
    pub original_subsampling: Option<SubsamplingMode>,
    /// Number of original tables available for reuse (0 or negative: none usable).
    pub original_num_quant_tables: i32,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            quality: 0.9,
            smoothing: 0.0,
            optimize: true,
            arithmetic: false,
            progressive: true,
            baseline: true,
            cmyk: false,
            subsampling: SubsamplingMode::Chroma444,
            restart: 0,
            dct: DctMethod::IntegerSlow,
            include_profile: true,
            include_comment: true,
            comment: None,
            include_exif: true,
            include_xmp: true,
            show_preview: false,
            use_original_quality: false,
            original_quality: 0,
            original_subsampling: None,
            original_num_quant_tables: -1,
        }
    }
}

/// Number of fields written by [`ExportConfig::to_defaults_string`].
const DEFAULTS_FIELDS: usize = 15;
/// Lines written before the comment and arithmetic-coding fields existed.
const DEFAULTS_FIELDS_OLD: usize = 13;

impl ExportConfig {
    /// Builds the config for exporting `image`: plug-in defaults, then the stored defaults, then
    /// the settings recovered from the JPEG file the image was loaded from.
    pub fn for_image(image: &Image) -> Self {
        let mut config = Self::default();
        if let Some(parasite) = image.parasite(DEFAULTS_PARASITE) {
            match std::str::from_utf8(parasite.data()) {
                Ok(s) => {
                    config.apply_defaults_string(s);
                }
                Err(_) => log::debug!("ignoring non-UTF-8 '{DEFAULTS_PARASITE}' parasite"),
            }
        }
        if let Some(parasite) = image.parasite(COMMENT_PARASITE) {
            let text = parasite.data();
            let text = text.strip_suffix(b"\0").unwrap_or(text);
            config.comment = Some(String::from_utf8_lossy(text).into_owned());
        }
        config.apply_original_settings(&settings::restore(image));
        config
    }

    /// Persists the tunable fields as the `"jpeg-save-options"` parasite.
    pub fn store_in(&self, image: &mut Image) {
        image.attach_parasite(Parasite::new(
            DEFAULTS_PARASITE,
            true,
            self.to_defaults_string().into_bytes(),
        ));
    }

    /// Serializes the tunable fields as one whitespace-separated line.
    pub fn to_defaults_string(&self) -> String {
        let mut out = String::new();
        let _ = write!(
            out,
            "{:.6} {:.6} {} {} {} {} {} {} {} {} {} {} {} {} {}",
            self.quality * 100.0,
            self.smoothing,
            i32::from(self.optimize),
            i32::from(self.progressive),
            self.subsampling.id(),
            i32::from(self.baseline),
            self.restart,
            self.dct as i32,
            i32::from(self.show_preview),
            i32::from(self.include_exif),
            i32::from(self.include_profile),
            i32::from(self.include_xmp),
            i32::from(self.use_original_quality),
            i32::from(self.include_comment),
            i32::from(self.arithmetic),
        );
        out
    }

    /// Applies a line written by [`ExportConfig::to_defaults_string`].
    ///
    /// Lines from older versions lacking the last two fields are accepted; missing fields keep
    /// their current value. Anything else leaves the config untouched and returns `false`.
    pub fn apply_defaults_string(&mut self, s: &str) -> bool {
        let fields: Vec<&str> = s.split_whitespace().collect();
        if fields.len() != DEFAULTS_FIELDS && fields.len() != DEFAULTS_FIELDS_OLD {
            log::debug!(
                "ignoring stored defaults with {} fields: {s:?}",
                fields.len()
            );
            return false;
        }

        let floats: Option<Vec<f64>> = fields[..2].iter().map(|f| f.parse().ok()).collect();
        let ints: Option<Vec<i64>> = fields[2..].iter().map(|f| f.parse().ok()).collect();
        let (Some(floats), Some(ints)) = (floats, ints) else {
            log::debug!("ignoring malformed stored defaults: {s:?}");
            return false;
        };

        let mut tmp = self.clone();
        tmp.quality = (floats[0] / 100.0).clamp(0.0, 1.0);
        tmp.smoothing = floats[1].clamp(0.0, 1.0);
        tmp.optimize = ints[0] != 0;
        tmp.progressive = ints[1] != 0;
        tmp.subsampling = SubsamplingMode::from_id(ints[2] as i32).unwrap_or(tmp.subsampling);
        tmp.baseline = ints[3] != 0;
        tmp.restart = u32::try_from(ints[4]).unwrap_or(0);
        tmp.dct = DctMethod::from_id(ints[5] as i32);
        tmp.show_preview = ints[6] != 0;
        tmp.include_exif = ints[7] != 0;
        tmp.include_profile = ints[8] != 0;
        tmp.include_xmp = ints[9] != 0;
        tmp.use_original_quality = ints[10] != 0;
        if let [comment, arithmetic] = &ints[11..] {
            tmp.include_comment = *comment != 0;
            tmp.arithmetic = *arithmetic != 0;
        }
        *self = tmp;
        true
    }

    /// Quality as the integer percentage handed to the encoder.
    pub fn quality_percent(&self) -> u8 {
        (self.quality * 100.0).round().clamp(0.0, 100.0) as u8
    }

    /// Sets the quality; leaves "use original quality" mode if it no longer matches.
    pub fn set_quality(&mut self, quality: f64) {
        self.quality = quality;
        if self.use_original_quality && (quality * 100.0).round() as i32 != self.original_quality
        {
            self.use_original_quality = false;
        }
    }

    /// Sets the subsampling; leaves "use original quality" mode if it no longer matches.
    pub fn set_subsampling(&mut self, mode: SubsamplingMode) {
        self.subsampling = mode;
        if self.use_original_quality && self.original_subsampling != Some(mode) {
            self.use_original_quality = false;
        }
    }

    /// Toggles "use original quality". Switching it on copies the original quality, and for
    /// RGB drawables the original subsampling, into the config.
    pub fn set_use_original_quality(&mut self, on: bool, is_rgb: bool) {
        self.use_original_quality = on;
        if on && self.original_quality > 0 {
            self.quality = f64::from(self.original_quality) / 100.0;
            if is_rgb {
                if let Some(mode) = self.original_subsampling {
                    self.subsampling = mode;
                }
            }
        }
    }

    /// Enables restart markers, picking the default interval when none is set.
    pub fn set_use_restart(&mut self, on: bool) {
        self.restart = match (on, self.restart) {
            (false, _) => 0,
            (true, 0) => DEFAULT_RESTART_MCU_ROWS,
            (true, rows) => rows,
        };
    }

    /// Seeds the config from the settings of the file the image was loaded from.
    ///
    /// The quality is raised to the original if that was higher. The original subsampling is
    /// adopted when it is 4:4:4, or when it is a 4:2:2 mode and the config is still at 4:4:4.
    /// "Use original quality" is switched on when both then match.
    pub fn apply_original_settings(&mut self, restored: &RestoredSettings) {
        self.original_quality = restored.quality.max(0);
        self.original_subsampling = restored.subsampling;
        self.original_num_quant_tables = restored.num_quant_tables;

        if restored.quality <= 0 {
            return;
        }

        if f64::from(restored.quality) > self.quality * 100.0 {
            self.quality = f64::from(restored.quality) / 100.0;
        }

        match restored.subsampling {
            Some(SubsamplingMode::Chroma444) => self.subsampling = SubsamplingMode::Chroma444,
            Some(mode @ (SubsamplingMode::Chroma422Horizontal | SubsamplingMode::Chroma422Vertical))
                if self.subsampling == SubsamplingMode::Chroma444 =>
            {
                self.subsampling = mode
            }
            _ => {}
        }

        if i32::from(self.quality_percent()) == restored.quality
            && Some(self.subsampling) == restored.subsampling
        {
            self.use_original_quality = true;
        }
    }

    /// Whether smoothing applies to the selected subsampling.
    #[inline]
    pub fn smoothing_applicable(&self) -> bool {
        !self.subsampling.is_asymmetric()
    }
}
