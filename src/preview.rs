//! Incremental preview export.
//!
//! A preview compresses the image into a temporary file one tile-height chunk per scheduler
//! tick, reports the resulting file size and shows the re-decoded file as a throwaway layer.
//! Everything runs on the caller's thread; the host's idle loop calls [`PreviewController::tick`].

use std::{fs, path::PathBuf, rc::Rc};

use tempfile::TempPath;

use crate::{
    codec::Backend,
    config::ExportConfig,
    error::{Error, Result},
    export::{Export, Exporter, ScanlineJob},
    image::{Image, Layer, NoProgress},
    import::Importer,
};

/// Result of one [`PreviewSession::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// More rows remain; step again on the next tick.
    Continue,
    /// The file was completed and the results were published.
    Done,
    /// The session was cancelled or failed; nothing was published.
    Cancelled,
}

/// The host side of a preview: the size label and the canvas.
pub trait PreviewSink {
    fn size_calculating(&mut self);
    fn size_known(&mut self, bytes: u64);
    /// The file was written but its size could not be determined.
    fn size_error(&mut self, message: &str);
    fn size_unknown(&mut self);
    fn show_layer(&mut self, layer: Layer);
    fn clear_layer(&mut self);
}

/// Label text for the preview file size.
pub fn size_label(bytes: Option<u64>) -> String {
    match bytes {
        Some(bytes) => format!("File size without metadata: {}", format_size(bytes)),
        None => "File size without metadata: unknown".into(),
    }
}

/// Formats a byte count with decimal (SI) prefixes and one fractional digit.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["kB", "MB", "GB", "TB", "PB", "EB"];
    if bytes < 1000 {
        return if bytes == 1 {
            "1 byte".into()
        } else {
            format!("{bytes} bytes")
        };
    }
    let mut value = bytes as f64 / 1000.0;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

/// State of one in-flight preview export.
pub struct PreviewSession {
    job: Option<ScanlineJob>,
    path: PathBuf,
    temp: Option<TempPath>,
    backend: Rc<dyn Backend>,
    tile_height: u32,
    cancelled: bool,
}

impl PreviewSession {
    pub(crate) fn new(
        job: ScanlineJob,
        path: PathBuf,
        backend: Rc<dyn Backend>,
        tile_height: u32,
    ) -> Self {
        Self {
            job: Some(job),
            path,
            temp: None,
            backend,
            tile_height,
            cancelled: false,
        }
    }

    /// Hands the temporary file's lifetime to the session.
    fn own_temp_file(&mut self, temp: TempPath) {
        self.temp = Some(temp);
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Requests cancellation; the next [`step`](Self::step) cleans up.
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Whether the session has finished (completed or cancelled) and released its resources.
    pub fn is_finished(&self) -> bool {
        self.job.is_none()
    }

    /// Rows compressed so far.
    pub fn rows_done(&self) -> u32 {
        self.job.as_ref().map_or(0, |job| job.next_scanline())
    }

    pub fn step(&mut self, sink: &mut dyn PreviewSink) -> SessionStatus {
        let Some(job) = self.job.as_mut() else {
            return if self.cancelled {
                SessionStatus::Cancelled
            } else {
                SessionStatus::Done
            };
        };

        if self.cancelled {
            if let Some(job) = self.job.take() {
                job.abort();
            }
            self.remove_file();
            return SessionStatus::Cancelled;
        }

        if !job.is_complete() {
            return match job.write_chunk(|_| {}) {
                Ok(()) => SessionStatus::Continue,
                Err(e) => {
                    log::debug!("preview disabled: {e}");
                    self.cancelled = true;
                    if let Some(job) = self.job.take() {
                        job.abort();
                    }
                    self.remove_file();
                    sink.size_unknown();
                    SessionStatus::Cancelled
                }
            };
        }

        let Some(job) = self.job.take() else {
            return SessionStatus::Done;
        };
        match job.finish() {
            Ok(()) => self.publish(sink),
            Err(e) => {
                log::debug!("preview disabled: {e}");
                sink.size_unknown();
            }
        }
        self.remove_file();
        SessionStatus::Done
    }

    fn publish(&self, sink: &mut dyn PreviewSink) {
        match fs::metadata(&self.path) {
            Ok(meta) => sink.size_known(meta.len()),
            Err(e) => sink.size_error(&e.to_string()),
        }

        let importer = Importer::with_backend(self.backend.clone()).tile_height(self.tile_height);
        match importer.import(&self.path, true) {
            Ok(imported) => match imported.image.layers().first() {
                Some(layer) => sink.show_layer(layer.clone()),
                None => log::debug!("preview decode produced no layer"),
            },
            Err(e) => log::debug!("preview decode failed: {e}"),
        }
    }

    fn remove_file(&mut self) {
        let result = match self.temp.take() {
            Some(temp) => temp.close(),
            None => fs::remove_file(&self.path),
        };
        if let Err(e) = result {
            log::debug!("could not remove '{}': {e}", self.path.display());
        }
    }

    /// Cancels the session and runs the cleanup step immediately.
    fn cancel_now(&mut self, sink: &mut dyn PreviewSink) {
        if !self.is_finished() {
            self.cancel();
            let status = self.step(sink);
            debug_assert_eq!(status, SessionStatus::Cancelled);
        }
    }
}

impl Drop for PreviewSession {
    fn drop(&mut self) {
        if let Some(job) = self.job.take() {
            job.abort();
            self.remove_file();
        }
    }
}

/// Owns the (at most one) live preview of an export dialog.
pub struct PreviewController {
    exporter: Exporter,
    session: Option<PreviewSession>,
}

impl PreviewController {
    pub fn new(exporter: Exporter) -> Self {
        Self {
            exporter,
            session: None,
        }
    }

    pub fn session(&self) -> Option<&PreviewSession> {
        self.session.as_ref()
    }

    /// Restarts the preview for the current parameters.
    ///
    /// Any running session is cancelled and cleaned up first. Failures only disable the preview.
    pub fn start(
        &mut self,
        config: &ExportConfig,
        image: &Image,
        drawable: &Layer,
        original: &Image,
        sink: &mut dyn PreviewSink,
    ) {
        self.destroy(sink);

        if !config.show_preview {
            sink.size_unknown();
            return;
        }

        match self.start_session(config, image, drawable, original) {
            Ok(session) => {
                assert!(self.session.is_none(), "preview session already running");
                self.session = Some(session);
                sink.size_calculating();
            }
            Err(e) => {
                log::debug!("preview disabled: {e}");
                sink.size_unknown();
            }
        }
    }

    fn start_session(
        &self,
        config: &ExportConfig,
        image: &Image,
        drawable: &Layer,
        original: &Image,
    ) -> Result<PreviewSession> {
        let temp = tempfile::Builder::new()
            .prefix("file-jpeg-preview-")
            .suffix(".jpg")
            .tempfile()
            .map_err(|e| Error::io("creating preview file", e))?
            .into_temp_path();

        let export = self.exporter.export(
            &temp,
            config,
            image,
            &[drawable],
            original,
            true,
            &mut NoProgress,
        )?;
        match export {
            Export::Preview(mut session) => {
                session.own_temp_file(temp);
                Ok(session)
            }
            Export::Done => Err(Error::from("preview export completed synchronously")),
        }
    }

    /// Advances the live session by one chunk. Returns `None` when no session is live.
    pub fn tick(&mut self, sink: &mut dyn PreviewSink) -> Option<SessionStatus> {
        let session = self.session.as_mut()?;
        let status = session.step(sink);
        if status != SessionStatus::Continue {
            self.session = None;
        }
        Some(status)
    }

    /// Runs the live session to completion.
    pub fn run(&mut self, sink: &mut dyn PreviewSink) -> Option<SessionStatus> {
        loop {
            match self.tick(sink)? {
                SessionStatus::Continue => {}
                status => return Some(status),
            }
        }
    }

    /// Cancels the live session synchronously and removes the preview layer.
    pub fn destroy(&mut self, sink: &mut dyn PreviewSink) {
        if let Some(mut session) = self.session.take() {
            session.cancel_now(sink);
        }
        sink.clear_layer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes() {
        assert_eq!(format_size(0), "0 bytes");
        assert_eq!(format_size(1), "1 byte");
        assert_eq!(format_size(999), "999 bytes");
        assert_eq!(format_size(1000), "1.0 kB");
        assert_eq!(format_size(12_345), "12.3 kB");
        assert_eq!(format_size(3_500_000), "3.5 MB");
        assert_eq!(size_label(Some(2048)), "File size without metadata: 2.0 kB");
        assert_eq!(size_label(None), "File size without metadata: unknown");
    }
}
