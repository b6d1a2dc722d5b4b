//! JPEG import and export for an image editor.
//!
//! Besides moving pixels through a codec, the crate keeps track of how a JPEG file was
//! originally encoded: [`estimate_quality`] recovers the IJG quality setting from the
//! quantization tables, the [`settings`] module persists it (together with the sampling factors
//! and, when no standard quality matches, the tables themselves) on the imported image, and
//! [`ExportConfig`] uses it to re-export the image without degrading it further.
//!
//! [`PreviewController`] runs an export incrementally into a temporary file to show the
//! resulting size and artifacts while the user adjusts parameters.

mod codec;
mod config;
mod error;
mod export;
mod file;
mod image;
mod import;
mod markers;
mod metadata;
mod preview;
mod quality;
pub mod settings;
mod smooth;


pub use codec::{
    restart_interval_mcus, Backend, Capabilities, Compress, CompressParams, Decompress,
    DefaultBackend, EncodeColor,
};
pub use config::{
    DctMethod, ExportConfig, SubsamplingMode, COMMENT_PARASITE, DEFAULTS_PARASITE,
    DEFAULT_RESTART_MCU_ROWS,
};
pub use error::{Error, ErrorKind};
pub use export::{Export, Exporter, DEFAULT_TILE_HEIGHT, EXIF_PARASITE, XMP_PARASITE};
pub use file::{DensityUnit, SofMarker};
pub use image::{
    BaseType, ColorProfile, Image, Layer, NoProgress, Parasite, PixelBuffer, PixelFormat,
    Progress, Unit, DEFAULT_RESOLUTION,
};
pub use import::{
    read_header, Component, Imported, Importer, JfifDensity, JpegHeader, LAYER_NAME,
    PREVIEW_LAYER_NAME,
};
pub use markers::{Density, Marker};
pub use metadata::{ColorSpace, QuantTable, QuantizationTableSet, Sampling};
pub use preview::{
    format_size, size_label, PreviewController, PreviewSession, PreviewSink, SessionStatus,
};
pub use quality::{estimate_quality, quality_scaling, standard_tables, DetectedQuality};
