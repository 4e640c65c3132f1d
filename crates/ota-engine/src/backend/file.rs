use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use ota_errors::ImageError;
use tracing::{debug, info};

use super::{BackendType, TransportBackend};

/// Image file read from a host filesystem or a mounted card.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    file: Option<File>,
    len: u64,
    backend_type: BackendType,
}

impl FileBackend {
    /// Backend for the image at `path`. The file is opened by
    /// [`open`](TransportBackend::open).
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: None,
            len: 0,
            backend_type: BackendType::Card,
        }
    }

    /// Report a different transport kind.
    #[must_use]
    pub fn with_backend_type(mut self, backend_type: BackendType) -> Self {
        self.backend_type = backend_type;
        self
    }

    /// Image path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TransportBackend for FileBackend {
    fn backend_type(&self) -> BackendType {
        self.backend_type
    }

    fn open(&mut self) -> Result<(), ImageError> {
        let file = File::open(&self.path)
            .map_err(|e| ImageError::transport(format!("{}: {e}", self.path.display())))?;
        self.len = file
            .metadata()
            .map_err(|e| ImageError::transport(format!("{}: {e}", self.path.display())))?
            .len();
        info!(path = %self.path.display(), len = self.len, "image file opened");
        self.file = Some(file);
        Ok(())
    }

    fn close(&mut self) -> Result<(), ImageError> {
        if self.file.take().is_some() {
            debug!(path = %self.path.display(), "image file closed");
        }
        Ok(())
    }

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), ImageError> {
        let len = self.len;
        let file = self.file.as_mut().ok_or(ImageError::NotOpen)?;
        let end = u64::from(offset).saturating_add(buf.len() as u64);
        if end > len {
            return Err(ImageError::OutOfBounds {
                offset,
                len: buf.len(),
                size: u32::try_from(len).unwrap_or(u32::MAX),
            });
        }
        file.seek(SeekFrom::Start(u64::from(offset)))
            .and_then(|_| file.read_exact(buf))
            .map_err(|e| ImageError::transport(format!("read at {offset:#x}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_file_backend_reads() -> Result<(), Box<dyn std::error::Error>> {
        let mut tmp = tempfile::NamedTempFile::new()?;
        tmp.write_all(&[1, 2, 3, 4, 5, 6])?;
        tmp.flush()?;

        let mut backend = FileBackend::new(tmp.path());
        let mut buf = [0u8; 3];
        assert!(matches!(backend.read(0, &mut buf), Err(ImageError::NotOpen)));

        backend.open()?;
        backend.read(2, &mut buf)?;
        assert_eq!(buf, [3, 4, 5]);
        assert!(matches!(
            backend.read(5, &mut buf),
            Err(ImageError::OutOfBounds { .. })
        ));
        backend.close()?;
        Ok(())
    }

    #[test]
    fn test_missing_file_is_transport_error() {
        let mut backend = FileBackend::new("/nonexistent/image.bin");
        assert!(matches!(backend.open(), Err(ImageError::Transport(_))));
    }
}
