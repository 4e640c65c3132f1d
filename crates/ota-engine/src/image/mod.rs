//! Image container
//!
//! [`OtaImage`] binds a [`TransportBackend`], validates the image head on
//! [`open`](OtaImage::open) and serves random-access reads of the image by
//! absolute offset or by directory name.
//!
//! Reads honour a sticky cancel flag, checked before every transport call.
//! Once set, every read fails with [`ImageError::Cancelled`]. Closing the
//! image clears the flag only if a read was refused because of it, so a
//! cancel raised between attempts stops the next one. Successful reads advance the progress counter, which emits
//! [`OtaEvent::Progress`] whenever the whole-percent value changes.

pub mod header;

use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ota_errors::ImageError;
use tracing::{debug, error, info, trace, warn};

use crate::backend::{BackendType, TransportBackend};
use crate::event::{EventSink, OtaEvent};
use crate::wire::crc32;

pub use header::{DirEntry, HEAD_SIZE, IMAGE_MAGIC, IMAGE_MAGIC_BYTES, ImageHeader, MAX_IMAGE_SIZE};

/// Progress never reports more than this before the final report.
pub const PROGRESS_UP_LIMIT: u8 = 99;

const DATA_CHECK_CHUNK: usize = 0x800;

#[derive(Debug, Default, Clone, Copy)]
struct Progress {
    on: bool,
    total: u32,
    current: u32,
    cursor: u8,
}

impl Progress {
    /// Percentage to report after `xfer` more bytes, if it changed.
    fn advance(&mut self, xfer: u32) -> Result<Option<u8>, ImageError> {
        if !self.on {
            return Ok(None);
        }
        let next_total = self.current.saturating_add(xfer);
        if xfer > self.total || next_total > self.total {
            return Err(ImageError::ProgressOverflow {
                reported: u64::from(next_total),
                total: u64::from(self.total),
            });
        }
        self.current = next_total;
        let next = percent(self.current, self.total).min(PROGRESS_UP_LIMIT);
        if next == self.cursor {
            return Ok(None);
        }
        self.cursor = next;
        Ok(Some(next))
    }
}

fn percent(current: u32, total: u32) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = u64::from(current).saturating_mul(100) / u64::from(total);
    u8::try_from(pct).unwrap_or(u8::MAX)
}

/// An image being read from a transport.
#[derive(Default)]
pub struct OtaImage {
    backend: Option<Box<dyn TransportBackend>>,
    header: Option<ImageHeader>,
    cached: Cell<Option<usize>>,
    progress: Progress,
    cancel: Arc<AtomicBool>,
    cancel_seen: Cell<bool>,
    sink: Option<Arc<dyn EventSink>>,
}

impl std::fmt::Debug for OtaImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OtaImage")
            .field("backend", &self.backend_type())
            .field("open", &self.header.is_some())
            .field("progress", &self.progress)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl OtaImage {
    /// Image with no backend bound.
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver progress to `sink`.
    pub fn set_event_sink(&mut self, sink: Option<Arc<dyn EventSink>>) {
        self.sink = sink;
    }

    /// Bind `backend`, returning the previously bound one.
    pub fn bind(&mut self, backend: Box<dyn TransportBackend>) -> Option<Box<dyn TransportBackend>> {
        info!(backend = %backend.backend_type(), "bind backend");
        self.backend.replace(backend)
    }

    /// Unbind and return the backend.
    pub fn unbind(&mut self) -> Option<Box<dyn TransportBackend>> {
        let backend = self.backend.take();
        if let Some(b) = &backend {
            info!(backend = %b.backend_type(), "unbind backend");
        }
        backend
    }

    /// Type of the bound backend, `Unknown` when none.
    pub fn backend_type(&self) -> BackendType {
        self.backend
            .as_ref()
            .map_or(BackendType::Unknown, |b| b.backend_type())
    }

    /// Whether a backend is bound.
    pub fn has_backend(&self) -> bool {
        self.backend.is_some()
    }

    /// Shared cancel flag, settable from any thread.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Make every further read fail.
    pub fn cancel_read(&self) {
        info!("image read cancelled");
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Whether reads have been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Open the backend and validate the image head.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::NotOpen`] without a backend, a transport error
    /// from the backend, or any head validation error.
    pub fn open(&mut self) -> Result<(), ImageError> {
        let backend = self.backend.as_mut().ok_or(ImageError::NotOpen)?;
        info!(backend = %backend.backend_type(), "open image");
        backend.open()?;

        let mut head = vec![0u8; HEAD_SIZE];
        self.read(0, &mut head)?;
        let header = ImageHeader::parse(&head).inspect_err(|e| {
            error!(error = %e, "image head rejected");
        })?;
        info!(
            version = %header.new_version,
            files = header.file_count(),
            data_size = header.data_size,
            "image head accepted"
        );
        self.header = Some(header);
        self.cached.set(None);
        Ok(())
    }

    /// Close the backend, drop the head and reset progress. A cancel that
    /// refused a read is consumed; one nothing has seen yet stays pending.
    ///
    /// The backend stays bound.
    pub fn close(&mut self) {
        if let Some(backend) = self.backend.as_mut()
            && let Err(e) = backend.close()
        {
            warn!(error = %e, "backend close failed");
        }
        self.header = None;
        self.cached.set(None);
        self.progress = Progress::default();
        if self.cancel_seen.replace(false) {
            debug!("cancel consumed");
            self.cancel.store(false, Ordering::SeqCst);
        }
    }

    /// Parsed head of the open image.
    pub fn header(&self) -> Option<&ImageHeader> {
        self.header.as_ref()
    }

    fn header_or_err(&self) -> Result<&ImageHeader, ImageError> {
        self.header.as_ref().ok_or(ImageError::NotOpen)
    }

    /// Directory entry for `name`.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::NotOpen`] or [`ImageError::FileNotFound`].
    pub fn find_file(&self, name: &str) -> Result<&DirEntry, ImageError> {
        let header = self.header_or_err()?;
        if let Some(entry) = self
            .cached
            .get()
            .and_then(|i| header.dir.get(i))
            .filter(|e| e.matches(name))
        {
            return Ok(entry);
        }
        let (index, entry) = header
            .dir
            .iter()
            .enumerate()
            .find(|(_, e)| e.matches(name))
            .ok_or_else(|| ImageError::FileNotFound(name.to_string()))?;
        self.cached.set(Some(index));
        Ok(entry)
    }

    /// Image offset of `name`; `None` addresses the whole image at offset 0.
    ///
    /// # Errors
    ///
    /// Same as [`find_file`](Self::find_file).
    pub fn file_offset(&self, name: Option<&str>) -> Result<u32, ImageError> {
        match name {
            None => Ok(0),
            Some(name) => Ok(self.find_file(name)?.offset),
        }
    }

    /// Length of `name`; `None` is the whole image.
    ///
    /// # Errors
    ///
    /// Same as [`find_file`](Self::find_file).
    pub fn file_length(&self, name: Option<&str>) -> Result<u32, ImageError> {
        match name {
            None => Ok(self.header_or_err()?.data_size),
            Some(name) => Ok(self.find_file(name)?.length),
        }
    }

    /// CRC32 of the payload as declared by the head.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::NotOpen`].
    pub fn data_checksum(&self) -> Result<u32, ImageError> {
        Ok(self.header_or_err()?.data_checksum)
    }

    fn check_cancel(&self) -> Result<(), ImageError> {
        if self.is_cancelled() {
            self.cancel_seen.set(true);
            return Err(ImageError::Cancelled);
        }
        Ok(())
    }

    /// Fill `buf` from image offset `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::Cancelled`] after [`cancel_read`](Self::cancel_read),
    /// [`ImageError::NotOpen`] without a backend, or the backend's error.
    pub fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), ImageError> {
        self.check_cancel()?;
        trace!(offset, len = buf.len(), "image read");
        let backend = self.backend.as_mut().ok_or(ImageError::NotOpen)?;
        backend.read(offset, buf)?;
        self.report_progress(buf.len());
        Ok(())
    }

    /// Whether the backend supports split prepare/complete reads.
    pub fn supports_prepared_reads(&self) -> bool {
        self.backend
            .as_ref()
            .is_some_and(|b| b.supports_prepared_reads())
    }

    /// Issue a request for `len` bytes at `offset`.
    ///
    /// # Errors
    ///
    /// Same as [`read`](Self::read).
    pub fn read_prepare(&mut self, offset: u32, len: usize) -> Result<(), ImageError> {
        self.check_cancel()?;
        let backend = self.backend.as_mut().ok_or(ImageError::NotOpen)?;
        backend.read_prepare(offset, len)
    }

    /// Receive the data of the matching [`read_prepare`](Self::read_prepare).
    ///
    /// # Errors
    ///
    /// Same as [`read`](Self::read).
    pub fn read_complete(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), ImageError> {
        self.check_cancel()?;
        let backend = self.backend.as_mut().ok_or(ImageError::NotOpen)?;
        backend.read_complete(offset, buf)?;
        self.report_progress(buf.len());
        Ok(())
    }

    /// Largest request the backend accepts.
    pub fn max_request_size(&self) -> Option<u32> {
        self.backend.as_ref().and_then(|b| b.max_request_size())
    }

    /// Backend transfer unit.
    pub fn write_unit(&self) -> u32 {
        self.backend.as_ref().map_or(1, |b| b.write_unit().max(1))
    }

    /// Recompute the payload CRC by reading `[data_offset, data_size)`.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::DataChecksum`] on mismatch, or a read error.
    pub fn check_data(&mut self) -> Result<(), ImageError> {
        let header = self.header_or_err()?;
        let (start, end, expected) = (
            u32::from(header.data_offset),
            header.data_size,
            header.data_checksum,
        );
        let mut hasher = crc32fast::Hasher::new();
        let mut buf = vec![0u8; DATA_CHECK_CHUNK];
        let mut addr = start;
        while addr < end {
            let len = (end.saturating_sub(addr) as usize).min(buf.len());
            let chunk = buf.get_mut(..len).unwrap_or_default();
            self.read(addr, chunk)?;
            hasher.update(chunk);
            addr = addr.saturating_add(len as u32);
        }
        let actual = hasher.finalize();
        if actual != expected {
            error!(expected, actual, "image data checksum mismatch");
            return Err(ImageError::DataChecksum { expected, actual });
        }
        debug!("image data checksum pass");
        Ok(())
    }

    /// CRC32 check of an in-memory copy of sub-file `name`.
    ///
    /// Returns the checksum the directory records and the one computed.
    ///
    /// # Errors
    ///
    /// Same as [`find_file`](Self::find_file).
    pub fn file_checksums(&self, name: &str, data: &[u8]) -> Result<(u32, u32), ImageError> {
        let expected = self.find_file(name)?.checksum;
        Ok((expected, crc32(data)))
    }

    /// Start progress accounting for `total` bytes of which `remaining` are
    /// still to be transferred. Ignored if already on.
    pub fn progress_on(&mut self, total: u32, remaining: u32) {
        if self.progress.on {
            return;
        }
        let mut progress = Progress {
            on: true,
            total,
            ..Progress::default()
        };
        if total > 0 && remaining < total {
            progress.current = total.saturating_sub(remaining);
            progress.cursor = percent(progress.current, total);
        }
        info!(remaining, total, percent = progress.cursor, "progress on");
        self.progress = progress;
    }

    /// Current progress percentage.
    pub fn progress_percent(&self) -> u8 {
        self.progress.cursor
    }

    fn report_progress(&mut self, xfer: usize) {
        let xfer = u32::try_from(xfer).unwrap_or(u32::MAX);
        match self.progress.advance(xfer) {
            Ok(Some(pct)) => self.emit_progress(pct),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "progress not updated"),
        }
    }

    /// Report 100 percent.
    pub fn report_final(&mut self) {
        if self.progress.on {
            self.emit_progress(100);
        }
    }

    fn emit_progress(&mut self, pct: u8) {
        debug!(percent = pct, "progress");
        if let Some(backend) = self.backend.as_mut() {
            backend.report_progress(pct);
        }
        if let Some(sink) = &self.sink {
            // Progress events cannot abort the attempt.
            let _flow = sink.on_event(&OtaEvent::Progress(pct));
        }
    }

    /// Tell the backend whether the image was accepted.
    pub fn report_image_valid(&mut self, valid: bool) {
        if let Some(backend) = self.backend.as_mut() {
            backend.report_image_valid(valid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::version::FirmwareVersion;

    fn image_bytes() -> Result<Vec<u8>, ImageError> {
        let payload = vec![0x5Au8; 0x1000];
        let header = ImageHeader {
            data_offset: HEAD_SIZE as u16,
            dir_offset: header::DIR_OFFSET as u16,
            data_size: (HEAD_SIZE + payload.len()) as u32,
            data_checksum: crc32(&payload),
            new_version: FirmwareVersion::new(2, "2", "board"),
            dir: vec![DirEntry::for_data("app.bin", HEAD_SIZE as u32, &payload)],
            ..ImageHeader::default()
        };
        let mut bytes = header.encode()?;
        bytes.extend_from_slice(&payload);
        Ok(bytes)
    }

    fn opened() -> Result<(OtaImage, MemoryBackend), ImageError> {
        let backend = MemoryBackend::new(image_bytes()?);
        let mut image = OtaImage::new();
        image.bind(Box::new(backend.clone()));
        image.open()?;
        Ok((image, backend))
    }

    #[test]
    fn test_open_and_lookup() -> Result<(), ImageError> {
        let (image, _) = opened()?;
        assert_eq!(image.file_offset(Some("app.bin"))?, HEAD_SIZE as u32);
        assert_eq!(image.file_length(Some("app.bin"))?, 0x1000);
        assert_eq!(image.file_offset(None)?, 0);
        assert_eq!(image.file_length(None)?, 0x1400);
        assert!(matches!(
            image.file_offset(Some("missing")),
            Err(ImageError::FileNotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn test_check_data() -> Result<(), ImageError> {
        let (mut image, _) = opened()?;
        image.check_data()
    }

    #[test]
    fn test_cancel_is_sticky_until_close() -> Result<(), ImageError> {
        let (mut image, _) = opened()?;
        image.cancel_read();
        let mut buf = [0u8; 4];
        assert!(matches!(image.read(0, &mut buf), Err(ImageError::Cancelled)));
        assert!(matches!(image.read(0, &mut buf), Err(ImageError::Cancelled)));
        image.close();
        assert!(!image.is_cancelled());
        Ok(())
    }

    #[test]
    fn test_cancel_between_attempts_stops_the_next_open() -> Result<(), ImageError> {
        let (mut image, _) = opened()?;
        image.close();
        image.cancel_read();
        image.close();
        assert!(image.is_cancelled());

        assert!(matches!(image.open(), Err(ImageError::Cancelled)));
        image.close();
        assert!(!image.is_cancelled());
        image.open()
    }

    #[test]
    fn test_progress_reports_on_change_and_caps() -> Result<(), ImageError> {
        let (mut image, backend) = opened()?;
        image.progress_on(200, 200);
        let mut buf = [0u8; 1];
        for _ in 0..200 {
            image.read(0x400, &mut buf)?;
        }
        image.report_final();
        let progress = backend.reports().lock().progress.clone();
        assert_eq!(progress.first(), Some(&1));
        assert!(progress.contains(&50));
        assert!(progress.iter().rev().skip(1).all(|&p| p <= PROGRESS_UP_LIMIT));
        assert_eq!(progress.last(), Some(&100));
        Ok(())
    }

    #[test]
    fn test_progress_reports_the_cap_once() -> Result<(), ImageError> {
        let (mut image, backend) = opened()?;
        image.progress_on(100, 100);
        let mut buf = [0u8; 1];
        for _ in 0..100 {
            image.read(0x400, &mut buf)?;
        }
        let progress = backend.reports().lock().progress.clone();
        assert_eq!(progress, (1..=PROGRESS_UP_LIMIT).collect::<Vec<_>>());

        image.report_final();
        let progress = backend.reports().lock().progress.clone();
        assert_eq!(progress.iter().filter(|&&p| p == PROGRESS_UP_LIMIT).count(), 1);
        assert_eq!(progress.last(), Some(&100));
        Ok(())
    }

    #[test]
    fn test_progress_resumes_from_remaining() {
        let mut image = OtaImage::new();
        image.progress_on(1000, 250);
        assert_eq!(image.progress_percent(), 75);
    }

    #[test]
    fn test_bad_header_rejected() -> Result<(), ImageError> {
        let mut bytes = image_bytes()?;
        if let Some(b) = bytes.get_mut(0x20) {
            *b ^= 0xFF;
        }
        let mut image = OtaImage::new();
        image.bind(Box::new(MemoryBackend::new(bytes)));
        assert!(matches!(image.open(), Err(ImageError::HeaderChecksum { .. })));
        assert!(image.header().is_none());
        Ok(())
    }
}
