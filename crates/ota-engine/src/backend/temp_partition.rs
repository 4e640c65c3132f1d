use std::sync::Arc;

use ota_errors::ImageError;
use tracing::{info, trace};

use super::{BackendType, TransportBackend, copy_range};
use crate::partition::PartitionTable;
use crate::platform::Platform;

/// Image staged in the temp partition, read back through the platform mapper.
///
/// Used by the secondary stage to install what recovery mode staged.
pub struct TempPartitionBackend {
    platform: Arc<dyn Platform>,
    offset: u32,
    size: u32,
}

impl std::fmt::Debug for TempPartitionBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TempPartitionBackend")
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl TempPartitionBackend {
    /// Backend over the table's temp partition, or `None` if it has none.
    pub fn new(platform: Arc<dyn Platform>, table: &dyn PartitionTable) -> Option<Self> {
        let part = table.temp_part()?;
        info!(offset = part.offset, size = part.size, "temp partition backend");
        Some(Self {
            platform,
            offset: part.offset,
            size: part.size,
        })
    }
}

impl TransportBackend for TempPartitionBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::TempPart
    }

    fn open(&mut self) -> Result<(), ImageError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), ImageError> {
        Ok(())
    }

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), ImageError> {
        trace!(offset, len = buf.len(), "temp partition read");
        let end = u64::from(offset).saturating_add(buf.len() as u64);
        if end > u64::from(self.size) {
            return Err(ImageError::OutOfBounds {
                offset,
                len: buf.len(),
                size: self.size,
            });
        }
        let addr = self.offset.saturating_add(offset);
        let region = self
            .platform
            .map(addr, buf.len(), false)
            .map_err(|e| ImageError::transport(e.to_string()))?;
        copy_range(&region, 0, buf)
    }
}
