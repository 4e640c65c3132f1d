use std::sync::Arc;

use ota_errors::ImageError;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{BackendType, TransportBackend, copy_range};

/// What a backend was told by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendReports {
    /// Progress percentages in the order they were reported
    pub progress: Vec<u8>,
    /// Last image verdict
    pub image_valid: Option<bool>,
    /// Number of `open` calls
    pub opens: u32,
    /// Number of `close` calls
    pub closes: u32,
}

/// Image held in memory.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    data: Arc<[u8]>,
    backend_type: BackendType,
    prepared_reads: bool,
    pending: Option<(u32, usize)>,
    max_request: Option<u32>,
    write_unit: u32,
    reports: Arc<Mutex<BackendReports>>,
}

impl MemoryBackend {
    /// Serve `data` as the image.
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            data: data.into(),
            backend_type: BackendType::Memory,
            prepared_reads: false,
            pending: None,
            max_request: None,
            write_unit: 1,
            reports: Arc::new(Mutex::new(BackendReports::default())),
        }
    }

    /// Report a different transport kind.
    #[must_use]
    pub fn with_backend_type(mut self, backend_type: BackendType) -> Self {
        self.backend_type = backend_type;
        self
    }

    /// Advertise split prepare/complete reads.
    #[must_use]
    pub fn with_prepared_reads(mut self, enabled: bool) -> Self {
        self.prepared_reads = enabled;
        self
    }

    /// Limit the request size.
    #[must_use]
    pub fn with_max_request_size(mut self, max: u32) -> Self {
        self.max_request = Some(max);
        self
    }

    /// Set the transfer unit.
    #[must_use]
    pub fn with_write_unit(mut self, unit: u32) -> Self {
        self.write_unit = unit.max(1);
        self
    }

    /// Shared view of everything reported to this backend.
    pub fn reports(&self) -> Arc<Mutex<BackendReports>> {
        Arc::clone(&self.reports)
    }

    /// Image length.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the image is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl TransportBackend for MemoryBackend {
    fn backend_type(&self) -> BackendType {
        self.backend_type
    }

    fn open(&mut self) -> Result<(), ImageError> {
        debug!(len = self.data.len(), "memory backend open");
        let mut reports = self.reports.lock();
        reports.opens = reports.opens.saturating_add(1);
        Ok(())
    }

    fn close(&mut self) -> Result<(), ImageError> {
        self.pending = None;
        let mut reports = self.reports.lock();
        reports.closes = reports.closes.saturating_add(1);
        Ok(())
    }

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), ImageError> {
        trace!(offset, len = buf.len(), "memory backend read");
        copy_range(&self.data, offset, buf)
    }

    fn supports_prepared_reads(&self) -> bool {
        self.prepared_reads
    }

    fn read_prepare(&mut self, offset: u32, len: usize) -> Result<(), ImageError> {
        self.pending = Some((offset, len));
        Ok(())
    }

    fn read_complete(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), ImageError> {
        match self.pending.take() {
            Some((pending, len)) if pending == offset && len == buf.len() => {
                copy_range(&self.data, offset, buf)
            }
            other => Err(ImageError::transport(format!(
                "read_complete({offset:#x}, {}) does not match prepared request {other:?}",
                buf.len()
            ))),
        }
    }

    fn max_request_size(&self) -> Option<u32> {
        self.max_request
    }

    fn write_unit(&self) -> u32 {
        self.write_unit
    }

    fn report_progress(&mut self, percent: u8) {
        self.reports.lock().progress.push(percent);
    }

    fn report_image_valid(&mut self, valid: bool) {
        self.reports.lock().image_valid = Some(valid);
    }
}
