//! Fault injection and event capture.
//!
//! A [`PowerCut`] models losing power in the middle of an attempt: once it
//! trips, a [`FaultyFlash`] rejects every program and erase and a
//! [`FaultyNvStore`] drops every journal write, so the shared
//! [`SimFlash`] and [`MemoryNvStore`] keep exactly what a real device would
//! hold after the cut. Building a new engine over fresh wrappers of the same
//! flash and store simulates the reboot.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use ota_engine::backend::{BackendType, MemoryBackend, TransportBackend};
use ota_engine::breakpoint::NvStore;
use ota_engine::event::{EventSink, OtaEvent, OtaState};
use ota_engine::flash::FlashDevice;
use ota_engine::sim::{MemoryNvStore, SimFlash};
use ota_errors::{ImageError, JournalError, StorageError};
use parking_lot::Mutex;
use tracing::debug;

/// Shared trip wire between a [`FaultyFlash`] and a [`FaultyNvStore`].
#[derive(Debug, Clone, Default)]
pub struct PowerCut {
    tripped: Arc<AtomicBool>,
    budget: Arc<AtomicU64>,
    armed: Arc<AtomicBool>,
}

impl PowerCut {
    /// A trip wire that never fires on its own.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip after `bytes` more bytes have been programmed.
    pub fn after_bytes(bytes: u64) -> Self {
        let cut = Self::new();
        cut.budget.store(bytes, Ordering::SeqCst);
        cut.armed.store(true, Ordering::SeqCst);
        cut
    }

    /// Trip now.
    pub fn trip(&self) {
        debug!("power cut");
        self.tripped.store(true, Ordering::SeqCst);
    }

    /// Whether the power is gone.
    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }

    /// Account for `len` programmed bytes; returns how many of them land
    /// before the cut.
    fn spend(&self, len: usize) -> usize {
        if self.is_tripped() {
            return 0;
        }
        if !self.armed.load(Ordering::SeqCst) {
            return len;
        }
        let left = self.budget.load(Ordering::SeqCst);
        let len64 = len as u64;
        if len64 < left {
            self.budget.store(left - len64, Ordering::SeqCst);
            len
        } else {
            self.budget.store(0, Ordering::SeqCst);
            self.trip();
            left as usize
        }
    }
}

/// Flash that fails once its [`PowerCut`] trips, or on a chosen operation.
#[derive(Debug, Clone)]
pub struct FaultyFlash {
    inner: SimFlash,
    cut: PowerCut,
    fail_write_at: Option<u32>,
    fail_erase: bool,
}

impl FaultyFlash {
    /// Wrap `inner`, sharing `cut`.
    pub fn new(inner: SimFlash, cut: PowerCut) -> Self {
        Self {
            inner,
            cut,
            fail_write_at: None,
            fail_erase: false,
        }
    }

    /// Fail any program touching `offset` with a device error.
    pub fn with_write_failure_at(mut self, offset: u32) -> Self {
        self.fail_write_at = Some(offset);
        self
    }

    /// Fail every erase with a device error.
    pub fn with_erase_failure(mut self) -> Self {
        self.fail_erase = true;
        self
    }

    fn power_lost(offset: u32, len: usize) -> StorageError {
        StorageError::Write {
            offset,
            len,
            reason: "power lost".into(),
        }
    }
}

impl FlashDevice for FaultyFlash {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn capacity(&self) -> u32 {
        self.inner.capacity()
    }

    fn is_xip(&self) -> bool {
        self.inner.is_xip()
    }

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), StorageError> {
        self.inner.read(offset, buf)
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), StorageError> {
        let plain = offset & !ota_engine::flash::ENCRYPT_ADDR_FLAG;
        if let Some(bad) = self.fail_write_at {
            let end = plain.saturating_add(data.len() as u32);
            if plain <= bad && bad < end {
                return Err(StorageError::Write {
                    offset,
                    len: data.len(),
                    reason: "injected program failure".into(),
                });
            }
        }
        let landed = self.cut.spend(data.len());
        if landed > 0 {
            self.inner.write(offset, data.get(..landed).unwrap_or_default())?;
        }
        if landed < data.len() {
            return Err(Self::power_lost(offset, data.len()));
        }
        Ok(())
    }

    fn erase(&mut self, offset: u32, len: u32) -> Result<(), StorageError> {
        if self.fail_erase || self.cut.is_tripped() {
            return Err(StorageError::Erase {
                offset,
                len,
                reason: "injected erase failure".into(),
            });
        }
        self.inner.erase(offset, len)
    }

    fn read_chip_id(&mut self) -> Result<u32, StorageError> {
        self.inner.read_chip_id()
    }

    fn set_write_protect(&mut self, enabled: bool) -> Result<(), StorageError> {
        self.inner.set_write_protect(enabled)
    }
}

/// Journal store that stops persisting once its [`PowerCut`] trips.
#[derive(Debug, Clone)]
pub struct FaultyNvStore {
    inner: MemoryNvStore,
    cut: PowerCut,
}

impl FaultyNvStore {
    /// Wrap `inner`, sharing `cut`.
    pub fn new(inner: MemoryNvStore, cut: PowerCut) -> Self {
        Self { inner, cut }
    }
}

impl NvStore for FaultyNvStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, JournalError> {
        self.inner.get(key)
    }

    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), JournalError> {
        if self.cut.is_tripped() {
            return Err(JournalError::Store("power lost".into()));
        }
        self.inner.set(key, value)
    }
}

/// In-memory transport that drops the link at a chosen image offset.
#[derive(Debug, Clone)]
pub struct FaultyBackend {
    inner: MemoryBackend,
    fail_from: Arc<Mutex<Option<u32>>>,
    cancel_at: Option<(u32, Arc<AtomicBool>)>,
}

impl FaultyBackend {
    /// Serve `image`.
    pub fn new(image: Vec<u8>) -> Self {
        Self {
            inner: MemoryBackend::new(image),
            fail_from: Arc::new(Mutex::new(None)),
            cancel_at: None,
        }
    }

    /// Time out every read that reaches `offset` or beyond.
    pub fn failing_from(self, offset: u32) -> Self {
        *self.fail_from.lock() = Some(offset);
        self
    }

    /// Raise `flag` when a read reaches `offset`, as a user pressing cancel.
    pub fn cancelling_at(mut self, offset: u32, flag: Arc<AtomicBool>) -> Self {
        self.cancel_at = Some((offset, flag));
        self
    }

    /// Report a different transport kind.
    pub fn with_backend_type(mut self, backend_type: BackendType) -> Self {
        self.inner = self.inner.with_backend_type(backend_type);
        self
    }

    /// Restore the link for every clone of this backend.
    pub fn heal(&self) {
        *self.fail_from.lock() = None;
    }
}

impl TransportBackend for FaultyBackend {
    fn backend_type(&self) -> BackendType {
        self.inner.backend_type()
    }

    fn open(&mut self) -> Result<(), ImageError> {
        self.inner.open()
    }

    fn close(&mut self) -> Result<(), ImageError> {
        self.inner.close()
    }

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), ImageError> {
        let end = offset.saturating_add(buf.len() as u32);
        if let Some((at, flag)) = &self.cancel_at
            && *at < end
        {
            flag.store(true, Ordering::SeqCst);
        }
        if let Some(from) = *self.fail_from.lock()
            && end > from
        {
            return Err(ImageError::Timeout { offset });
        }
        self.inner.read(offset, buf)
    }

    fn max_request_size(&self) -> Option<u32> {
        self.inner.max_request_size()
    }

    fn write_unit(&self) -> u32 {
        self.inner.write_unit()
    }

    fn report_progress(&mut self, percent: u8) {
        self.inner.report_progress(percent);
    }

    fn report_image_valid(&mut self, valid: bool) {
        self.inner.report_image_valid(valid);
    }
}

/// Sink that records every event, optionally breaking on one state.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<OtaEvent>>,
    break_on: Option<OtaState>,
}

impl RecordingSink {
    /// Record everything, never break.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record everything and return `Break` on the transition to `state`.
    pub fn breaking_on(state: OtaState) -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            break_on: Some(state),
        })
    }

    /// Target states in order.
    pub fn states(&self) -> Vec<OtaState> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                OtaEvent::State { to, .. } => Some(*to),
                _ => None,
            })
            .collect()
    }

    /// Progress percentages in order.
    pub fn progress(&self) -> Vec<u8> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                OtaEvent::Progress(p) => Some(*p),
                _ => None,
            })
            .collect()
    }

    /// Last image verdict.
    pub fn image_valid(&self) -> Option<bool> {
        self.events.lock().iter().rev().find_map(|e| match e {
            OtaEvent::ImageValid(v) => Some(*v),
            _ => None,
        })
    }

    /// Whether the transition to `state` was seen.
    pub fn saw(&self, state: OtaState) -> bool {
        self.states().contains(&state)
    }

    /// Forget everything recorded.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for RecordingSink {
    fn on_event(&self, event: &OtaEvent) -> ControlFlow<()> {
        self.events.lock().push(*event);
        match (event, self.break_on) {
            (OtaEvent::State { to, .. }, Some(target)) if *to == target => ControlFlow::Break(()),
            _ => ControlFlow::Continue(()),
        }
    }
}

/// Sink calling a closure.
pub struct FnSink<F>(pub F);

impl<F> std::fmt::Debug for FnSink<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FnSink")
    }
}

impl<F> EventSink for FnSink<F>
where
    F: Fn(&OtaEvent) -> ControlFlow<()> + Send + Sync,
{
    fn on_event(&self, event: &OtaEvent) -> ControlFlow<()> {
        (self.0)(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_cut_tears_the_write() {
        let flash = SimFlash::new(0x1000);
        let cut = PowerCut::after_bytes(10);
        let mut faulty = FaultyFlash::new(flash.clone(), cut.clone());
        assert!(faulty.write(0, &[0u8; 8]).is_ok());
        assert!(faulty.write(8, &[0u8; 8]).is_err());
        assert!(cut.is_tripped());
        assert_eq!(flash.slice(8, 4), vec![0, 0, 0xFF, 0xFF]);
    }

    #[test]
    fn test_store_freezes_after_cut() {
        let store = MemoryNvStore::new();
        let cut = PowerCut::new();
        let mut faulty = FaultyNvStore::new(store.clone(), cut.clone());
        assert!(faulty.set("k", b"1").is_ok());
        cut.trip();
        assert!(faulty.set("k", b"2").is_err());
        assert_eq!(store.raw("k"), Some(b"1".to_vec()));
    }

    #[test]
    fn test_backend_fails_past_offset_until_healed() {
        let mut backend = FaultyBackend::new(vec![1u8; 64]).failing_from(32);
        let mut buf = [0u8; 16];
        assert!(backend.read(0, &mut buf).is_ok());
        assert!(matches!(backend.read(24, &mut buf), Err(ImageError::Timeout { offset: 24 })));
        backend.heal();
        assert!(backend.read(24, &mut buf).is_ok());
    }

    #[test]
    fn test_recording_sink_breaks_on_target() {
        let sink = RecordingSink::breaking_on(OtaState::Uploading);
        let flow = sink.on_event(&OtaEvent::State {
            from: None,
            to: OtaState::Uploading,
        });
        assert!(flow.is_break());
        assert!(sink.saw(OtaState::Uploading));
    }
}
