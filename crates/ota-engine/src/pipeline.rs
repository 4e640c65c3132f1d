//! Reader/writer transfer pipeline
//!
//! A reader thread pulls a file from its source into a bounded byte ring
//! while the calling thread drains the ring onto flash. Both sides block on
//! a condition variable: the reader while the ring is full, the writer until
//! at least one write unit is available. The first reader error is handed to
//! the writer, which gives up at its next take; a writer error stops the
//! reader at its next push.
//!
//! ```text
//!  source --read--> [ reader thread ] --push--> ring --take--> writer --> flash
//! ```

use std::collections::VecDeque;

use ota_errors::{ImageError, OtaError};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace};

use crate::image::OtaImage;
use crate::platform::Platform;

/// Where file bytes come from.
pub(crate) enum ChunkSource<'a> {
    /// The bound transport, optionally with split prepare/complete reads
    Image {
        image: &'a mut OtaImage,
        prepared: bool,
        segment: usize,
    },
    /// An image already staged on local flash at `base`
    Staged { platform: &'a dyn Platform, base: u32 },
}

impl ChunkSource<'_> {
    fn fetch(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), OtaError> {
        match self {
            ChunkSource::Image {
                image,
                prepared: true,
                segment,
            } => {
                image.read_prepare(offset, buf.len())?;
                let mut addr = offset;
                for chunk in buf.chunks_mut((*segment).max(1)) {
                    image.read_complete(addr, chunk)?;
                    addr = addr.saturating_add(chunk.len() as u32);
                }
                Ok(())
            }
            ChunkSource::Image { image, .. } => Ok(image.read(offset, buf)?),
            ChunkSource::Staged { platform, base } => {
                let region = platform.map(base.saturating_add(offset), buf.len(), false)?;
                let src = region.get(..buf.len()).ok_or(ImageError::Truncated {
                    expected: buf.len(),
                    actual: region.len(),
                })?;
                buf.copy_from_slice(src);
                Ok(())
            }
        }
    }
}

/// Sizes for one transfer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TransferPlan {
    /// Source offset of the first byte
    pub offset: u32,
    /// Bytes to move
    pub len: u32,
    /// Largest single source request
    pub request: usize,
    /// Largest single flash write
    pub in_buffer: usize,
    /// Ring capacity
    pub ring_capacity: usize,
    /// Every write but the last is a multiple of this
    pub align: usize,
}

#[derive(Default)]
struct Ring {
    data: VecDeque<u8>,
    finished: bool,
    stopped: bool,
    failed: Option<OtaError>,
}

struct Shared {
    ring: Mutex<Ring>,
    readable: Condvar,
    writable: Condvar,
    capacity: usize,
}

impl Shared {
    fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(Ring::default()),
            readable: Condvar::new(),
            writable: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// Returns `false` once the writer has stopped.
    fn push(&self, mut bytes: &[u8]) -> bool {
        let mut ring = self.ring.lock();
        while !bytes.is_empty() {
            while ring.data.len() >= self.capacity && !ring.stopped {
                self.writable.wait(&mut ring);
            }
            if ring.stopped {
                return false;
            }
            let room = self.capacity.saturating_sub(ring.data.len()).min(bytes.len());
            let (now, later) = bytes.split_at(room);
            ring.data.extend(now);
            bytes = later;
            self.readable.notify_one();
        }
        true
    }

    fn fail(&self, e: OtaError) {
        let mut ring = self.ring.lock();
        if ring.failed.is_none() {
            ring.failed = Some(e);
        }
        self.readable.notify_all();
    }

    fn finish(&self) {
        self.ring.lock().finished = true;
        self.readable.notify_all();
    }

    fn stop(&self) {
        self.ring.lock().stopped = true;
        self.writable.notify_all();
    }

    /// Take the next write: at least one `align` unit unless fewer than that
    /// remain, at most `max`, and a whole number of units unless it is the
    /// last.
    fn take(&self, remaining: usize, max: usize, align: usize) -> Result<Vec<u8>, OtaError> {
        let align = align.max(1);
        let want = remaining.min(align);
        let mut ring = self.ring.lock();
        loop {
            if let Some(e) = ring.failed.take() {
                return Err(e);
            }
            if ring.data.len() >= want {
                break;
            }
            if ring.finished {
                return Err(ImageError::Truncated {
                    expected: remaining,
                    actual: ring.data.len(),
                }
                .into());
            }
            self.readable.wait(&mut ring);
        }
        let mut n = ring.data.len().min(max.max(want)).min(remaining);
        if n < remaining {
            n = n / align * align;
        }
        let out: Vec<u8> = ring.data.drain(..n).collect();
        self.writable.notify_one();
        Ok(out)
    }
}

fn read_loop(mut source: ChunkSource<'_>, plan: &TransferPlan, shared: &Shared) {
    let mut buf = vec![0u8; plan.request.max(1)];
    let mut offs = 0u32;
    while offs < plan.len {
        let len = (plan.len.saturating_sub(offs) as usize).min(buf.len());
        let chunk = buf.get_mut(..len).unwrap_or_default();
        if let Err(e) = source.fetch(plan.offset.saturating_add(offs), chunk) {
            debug!(offset = offs, error = %e, "reader stopped on error");
            shared.fail(e);
            return;
        }
        if !shared.push(chunk) {
            trace!(offset = offs, "reader stopped by writer");
            return;
        }
        offs = offs.saturating_add(len as u32);
    }
    shared.finish();
}

/// Move `plan.len` bytes from `source` through `write`, which receives each
/// chunk with its offset relative to the start of the transfer.
pub(crate) fn transfer<F>(source: ChunkSource<'_>, plan: TransferPlan, mut write: F) -> Result<(), OtaError>
where
    F: FnMut(u32, &[u8]) -> Result<(), OtaError>,
{
    let shared = Shared::new(plan.ring_capacity.max(plan.align));
    std::thread::scope(|scope| {
        let (plan_ref, shared_ref) = (&plan, &shared);
        let reader = std::thread::Builder::new()
            .name("ota-rx".into())
            .spawn_scoped(scope, move || read_loop(source, plan_ref, shared_ref))?;

        let mut result = Ok(());
        let mut offs = 0u32;
        while offs < plan.len {
            let remaining = plan.len.saturating_sub(offs) as usize;
            let chunk = match shared.take(remaining, plan.in_buffer, plan.align) {
                Ok(chunk) => chunk,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            };
            if let Err(e) = write(offs, &chunk) {
                result = Err(e);
                break;
            }
            offs = offs.saturating_add(chunk.len() as u32);
        }
        shared.stop();

        if reader.join().is_err() {
            error!("reader thread panicked");
            return Err(ImageError::transport("reader thread panicked").into());
        }
        result
    })
}
