//! Raw flash device, watchdog and scheduler-lock seams
//!
//! The engine never talks to hardware directly. A board provides a
//! [`FlashDevice`] for the storage the image is written to, a [`Watchdog`]
//! that is fed between long flash operations and a [`SchedulerLock`] that
//! makes block erases non-preemptible when code executes from the same bank.

use std::sync::Arc;

use ota_errors::StorageError;

/// Smallest erasable unit.
pub const SECTOR_SIZE: u32 = 0x1000;

/// Large erase block.
pub const BLOCK_SIZE: u32 = 0x10000;

/// Sectors per large erase block.
pub const SECTORS_PER_BLOCK: u32 = BLOCK_SIZE / SECTOR_SIZE;

/// Address bit that routes a write through the inline encryption engine.
pub const ENCRYPT_ADDR_FLAG: u32 = 0x8000_0000;

/// Value of an erased flash byte.
pub const ERASED_BYTE: u8 = 0xFF;

/// A raw NOR-style flash device.
///
/// Writes may only clear bits; [`erase`](FlashDevice::erase) is the only way
/// to return bytes to [`ERASED_BYTE`]. Hardware busy polling happens inside
/// these calls and has no software timeout.
pub trait FlashDevice: Send {
    /// Device name, used in logs.
    fn name(&self) -> &str;

    /// Capacity in bytes.
    fn capacity(&self) -> u32;

    /// Whether code executes in place from this device.
    fn is_xip(&self) -> bool {
        false
    }

    /// Read `buf.len()` bytes at `offset`.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`] on bus or range failure.
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), StorageError>;

    /// Program `data` at `offset`. The [`ENCRYPT_ADDR_FLAG`] bit may be set.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`] on bus, range or protection failure.
    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), StorageError>;

    /// Erase `len` bytes at `offset`; both must be sector aligned.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`] on misalignment or device failure.
    fn erase(&mut self, offset: u32, len: u32) -> Result<(), StorageError>;

    /// JEDEC identifier.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`] if the device does not answer.
    fn read_chip_id(&mut self) -> Result<u32, StorageError>;

    /// Enable or disable hardware write protection.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`] if the status register cannot be written.
    fn set_write_protect(&mut self, enabled: bool) -> Result<(), StorageError>;
}

impl<F: FlashDevice + ?Sized> FlashDevice for Box<F> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn capacity(&self) -> u32 {
        (**self).capacity()
    }

    fn is_xip(&self) -> bool {
        (**self).is_xip()
    }

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), StorageError> {
        (**self).read(offset, buf)
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), StorageError> {
        (**self).write(offset, data)
    }

    fn erase(&mut self, offset: u32, len: u32) -> Result<(), StorageError> {
        (**self).erase(offset, len)
    }

    fn read_chip_id(&mut self) -> Result<u32, StorageError> {
        (**self).read_chip_id()
    }

    fn set_write_protect(&mut self, enabled: bool) -> Result<(), StorageError> {
        (**self).set_write_protect(enabled)
    }
}

/// Watchdog fed between flash bursts.
pub trait Watchdog: Send {
    /// Reset the watchdog timer.
    fn feed(&mut self);
}

/// Watchdog for hosts without one.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWatchdog;

impl Watchdog for NoopWatchdog {
    fn feed(&mut self) {}
}

/// Global scheduler lock.
///
/// Erasing the bank code executes from must not be preempted by any task,
/// interrupt-driven ones included.
pub trait SchedulerLock: Send + Sync {
    /// Stop the scheduler.
    fn lock(&self);

    /// Resume the scheduler.
    fn unlock(&self);
}

/// Scheduler lock for hosts without a scheduler to stop.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSchedulerLock;

impl SchedulerLock for NoopSchedulerLock {
    fn lock(&self) {}

    fn unlock(&self) {}
}

/// Holds the scheduler locked until dropped.
#[must_use = "the scheduler is unlocked as soon as the guard is dropped"]
pub struct SchedulerGuard {
    lock: Arc<dyn SchedulerLock>,
}

impl SchedulerGuard {
    /// Lock the scheduler.
    pub fn acquire(lock: Arc<dyn SchedulerLock>) -> Self {
        lock.lock();
        Self { lock }
    }
}

impl Drop for SchedulerGuard {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// Round `value` down to a multiple of `align` (a power of two).
pub fn align_down(value: u32, align: u32) -> u32 {
    value & !align.wrapping_sub(1)
}

/// Round `value` up to a multiple of `align` (a power of two), saturating.
pub fn align_up(value: u32, align: u32) -> u32 {
    align_down(value.saturating_add(align.wrapping_sub(1)), align)
}
