//! Upgrade orchestrator
//!
//! [`OtaUpgrade`] owns the storage handle, the breakpoint journal and the
//! image container, and runs one attempt per [`check`](OtaUpgrade::check):
//!
//! 1. reload the journal and run the prepare pass
//! 2. open the image and parse its manifest
//! 3. decide whether the image applies ([`UpgradeDecision`])
//! 4. write and verify every file, boot and parameter files last
//! 5. mark the journal done (or pending, for a staged install)
//!
//! # Install modes
//!
//! - [`InstallMode::Mirror`]: files go to the inactive bank.
//! - [`InstallMode::Recovery`]: the whole image is staged in the temp
//!   partition, then only the boot and parameter files are written; the
//!   secondary stage installs the rest.
//! - [`InstallMode::RecoveryApp`]: the secondary stage, reading the staged
//!   image through a [`TempPartitionBackend`](crate::backend::TempPartitionBackend).
//!
//! # Failure handling
//!
//! Errors whose class is resumable (transport, cancellation) leave the
//! journal as it was so the next attempt continues from the saved offset.
//! Every other error moves the journal to a `*_FAIL` state, which the next
//! prepare pass treats as "erase everything".

mod commit;
mod decision;
mod prepare;
mod status;
mod transfer;
mod verify;

use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use ota_crypto::ImageVerifyingKey;
use ota_errors::{ErrorClass, OtaError};
use tracing::{debug, error, info, info_span, warn};

use crate::backend::{BackendType, TransportBackend};
use crate::breakpoint::{Breakpoint, BreakpointJournal, BreakpointState, NvStore};
use crate::config::{InstallMode, OtaConfig};
use crate::event::{EventSink, OtaEvent, OtaState};
use crate::image::OtaImage;
use crate::manifest::Manifest;
use crate::partition::PartitionTable;
use crate::platform::Platform;
use crate::storage::{OtaStorage, StorageStats};

pub use decision::{Refusal, UpgradeDecision};
pub use status::{UpgradeStatus, other_writing_partition, read_status, set_other_writing};

/// Name of the single file a recovery install stages.
pub const TEMP_FILE_NAME: &str = "TEMP.bin";

/// Everything an [`OtaUpgrade`] is bound to.
pub struct UpgradeContext {
    /// Flash the files are written to
    pub storage: OtaStorage,
    /// Board partition table
    pub table: Arc<dyn PartitionTable>,
    /// Running version and flash mapping
    pub platform: Arc<dyn Platform>,
    /// Store holding the breakpoint record
    pub store: Box<dyn NvStore>,
    /// Receiver of state, progress and verdict events
    pub sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for UpgradeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpgradeContext")
            .field("storage", &self.storage)
            .finish_non_exhaustive()
    }
}

/// Upgrade engine for one storage device.
pub struct OtaUpgrade {
    config: OtaConfig,
    key: Option<ImageVerifyingKey>,
    storage: OtaStorage,
    table: Arc<dyn PartitionTable>,
    platform: Arc<dyn Platform>,
    journal: BreakpointJournal,
    image: OtaImage,
    sink: Arc<dyn EventSink>,
    state: Option<OtaState>,
    patch_image: bool,
    temp_image_offset: u32,
    breakpoint_reported: bool,
    xfer_time: Duration,
}

impl std::fmt::Debug for OtaUpgrade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OtaUpgrade")
            .field("mode", &self.config.install_mode)
            .field("state", &self.state)
            .field("journal", &self.journal)
            .field("image", &self.image)
            .finish_non_exhaustive()
    }
}

impl OtaUpgrade {
    /// Validate `config`, load the journal and, unless
    /// [`skip_init_erase`](OtaConfig::skip_init_erase) is set, erase every
    /// partition an attempt may write.
    ///
    /// Emits [`OtaState::Init`].
    ///
    /// # Errors
    ///
    /// Returns [`OtaError::Config`] for an invalid configuration, or a
    /// journal or flash error from the initial prepare.
    pub fn new(config: OtaConfig, ctx: UpgradeContext) -> Result<Self, OtaError> {
        config.validate()?;
        let key = config.verifying_key()?;
        let storage = ctx
            .storage
            .with_max_write_burst(config.max_write_burst)
            .with_read_segment(config.read_segment);
        let mut image = OtaImage::new();
        image.set_event_sink(Some(Arc::clone(&ctx.sink)));
        let journal = BreakpointJournal::new(ctx.store, config.journal_save_granule);

        let mut upgrade = Self {
            config,
            key,
            storage,
            table: ctx.table,
            platform: ctx.platform,
            journal,
            image,
            sink: ctx.sink,
            state: None,
            patch_image: false,
            temp_image_offset: 0,
            breakpoint_reported: false,
            xfer_time: Duration::ZERO,
        };
        info!(
            mode = %upgrade.config.install_mode,
            storage = upgrade.storage.device_name(),
            "ota engine init"
        );
        upgrade.load_journal()?;
        upgrade.journal.clear_all_file_states();
        if upgrade.config.skip_init_erase {
            debug!("initial erase skipped");
        } else {
            upgrade.prepare_init()?;
        }
        upgrade.notify(OtaState::Init);
        Ok(upgrade)
    }

    /// Replace the event sink.
    pub fn set_event_sink(&mut self, sink: Arc<dyn EventSink>) {
        self.image.set_event_sink(Some(Arc::clone(&sink)));
        self.sink = sink;
    }

    /// Attach a transport. Re-attaching the same kind replaces it.
    ///
    /// # Errors
    ///
    /// Returns [`OtaError::BackendBusy`] if a different kind is attached.
    pub fn attach_backend(&mut self, backend: Box<dyn TransportBackend>) -> Result<(), OtaError> {
        let attached = self.image.backend_type();
        let requested = backend.backend_type();
        if self.image.has_backend() && attached != requested {
            warn!(%attached, %requested, "backend busy");
            return Err(OtaError::BackendBusy {
                attached: attached.to_string(),
                requested: requested.to_string(),
            });
        }
        if self.image.bind(backend).is_some() {
            debug!(%requested, "backend replaced");
        }
        Ok(())
    }

    /// Detach and return the transport.
    pub fn detach_backend(&mut self) -> Option<Box<dyn TransportBackend>> {
        self.image.unbind()
    }

    /// Kind of the attached transport.
    pub fn backend_type(&self) -> BackendType {
        self.image.backend_type()
    }

    /// Make the transfer in flight fail at its next read. With no attempt
    /// running, the next attempt fails when it opens the image.
    pub fn cancel_read(&self) {
        self.image.cancel_read();
    }

    /// Shared cancel flag for use from other threads.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.image.cancel_handle()
    }

    /// Whether the journal shows an installed or installing upgrade.
    pub fn is_in_progress(&self) -> bool {
        self.journal.state().is_in_progress()
    }

    /// Journal record as last loaded or saved.
    pub fn breakpoint(&self) -> &Breakpoint {
        self.journal.breakpoint()
    }

    /// Snapshot of the journal for reporting.
    pub fn status(&self) -> UpgradeStatus {
        UpgradeStatus::from_breakpoint(self.journal.breakpoint())
    }

    /// Forget every file state in memory; the next save persists it.
    pub fn clear_file_states(&mut self) {
        self.journal.clear_all_file_states();
    }

    /// Storage timing diagnostics.
    pub fn storage_stats(&self) -> &StorageStats {
        self.storage.stats()
    }

    /// Time spent in the last transfer.
    pub fn transfer_time(&self) -> Duration {
        self.xfer_time
    }

    /// Configuration in effect.
    pub fn config(&self) -> &OtaConfig {
        &self.config
    }

    /// Run one upgrade attempt against the attached transport.
    ///
    /// The outcome is also reported through the event sink: `Done` on
    /// success, `Fail` otherwise, followed by `Init` when the failure leaves
    /// the device ready for another attempt.
    ///
    /// # Errors
    ///
    /// Returns [`OtaError::BackendUnavailable`] without a transport, or the
    /// error that ended the attempt. [`OtaError::is_resumable`] tells whether
    /// a retry continues where this attempt stopped.
    pub fn check(&mut self) -> Result<(), OtaError> {
        let span = info_span!(
            "ota_check",
            mode = %self.config.install_mode,
            backend = %self.image.backend_type()
        );
        let _enter = span.enter();

        if !self.image.has_backend() {
            error!("no backend attached");
            return Err(OtaError::BackendUnavailable);
        }

        self.load_journal()?;
        self.prepare()?;
        self.notify(OtaState::InitFinished);
        self.breakpoint_reported = false;
        self.storage.reset_stats();

        if let Err(e) = self.image.open() {
            error!(error = %e, "image open failed");
            self.notify(OtaState::Cancel);
            self.image.close();
            return Err(e.into());
        }

        let result = self.run_attempt();
        match &result {
            Ok(()) => {
                self.image.report_final();
                self.report_image_valid(true);
                self.notify(OtaState::Done);
                self.storage.stats().log_summary();
                info!(
                    xfer_ms = u64::try_from(self.xfer_time.as_millis()).unwrap_or(u64::MAX),
                    "upgrade done"
                );
            }
            Err(e) => {
                error!(error = %e, class = %e.class(), state = %self.journal.state(), "upgrade failed");
                self.report_image_valid(false);
                self.notify(OtaState::Fail);
                if e.is_resumable()
                    || e.class() == ErrorClass::Declined
                    || matches!(e, OtaError::Manifest(_))
                {
                    self.notify(OtaState::Init);
                }
            }
        }
        self.image.close();
        result
    }

    fn run_attempt(&mut self) -> Result<(), OtaError> {
        if self.config.install_mode == InstallMode::RecoveryApp {
            self.image.check_data()?;
        }

        let mut manifest = Manifest::load(&mut self.image)?;
        self.patch_image = manifest.is_patch();
        self.apply_decision(&manifest)?;
        self.statistics(&manifest)?;

        let backend_type = self.image.backend_type();
        let data_checksum = self.image.data_checksum()?;
        let bp = self.journal.breakpoint_mut();
        bp.backend_type = backend_type;
        bp.new_version = manifest.version.version_code;
        bp.data_checksum = data_checksum;
        self.notify(OtaState::Running);

        let start = Instant::now();
        let result = if self.config.install_mode.writes_partitions() {
            self.run_partition_install(&mut manifest)
        } else {
            self.run_staged_install(&mut manifest)
        };
        self.xfer_time = start.elapsed();
        result
    }

    fn run_partition_install(&mut self, manifest: &mut Manifest) -> Result<(), OtaError> {
        self.journal.update_state(BreakpointState::UpgradeWriting)?;
        self.do_upgrade(manifest)
            .map_err(|e| self.mark_failed(BreakpointState::UpgradingFail, e))?;
        self.journal.update_state(BreakpointState::UpgradeDone)?;
        self.notify(OtaState::Uploading);
        Ok(())
    }

    fn run_staged_install(&mut self, manifest: &mut Manifest) -> Result<(), OtaError> {
        self.journal.update_state(BreakpointState::WritingImg)?;
        self.write_temp_img()
            .map_err(|e| self.mark_failed(BreakpointState::WritingImgFail, e))?;
        self.verify_temp_image()
            .map_err(|e| self.mark_failed(BreakpointState::WritingImgFail, e))?;
        self.write_boot_image(manifest)
            .map_err(|e| self.mark_failed(BreakpointState::UpgradingFail, e))?;

        if self.emit(OtaState::Uploading).is_break() {
            warn!("commit aborted by event sink");
            return Err(OtaError::Aborted);
        }
        self.write_temp_flag()?;
        self.journal.update_state(BreakpointState::UpgradePending)?;
        Ok(())
    }

    fn load_journal(&mut self) -> Result<(), OtaError> {
        let defaults = Breakpoint::with_defaults(
            self.platform.current_version().version_code,
            self.table.inactive_mirror(),
        );
        self.journal.load_or_init(defaults)?;
        Ok(())
    }

    /// Move the journal to `state` unless `err` keeps the attempt resumable.
    fn mark_failed(&mut self, state: BreakpointState, err: OtaError) -> OtaError {
        if !err.is_resumable()
            && let Err(e) = self.journal.update_state(state)
        {
            error!(error = %e, %state, "failure state not saved");
        }
        err
    }

    fn report_image_valid(&mut self, valid: bool) {
        self.image.report_image_valid(valid);
        if self.sink.on_event(&OtaEvent::ImageValid(valid)).is_break() {
            debug!("break on image verdict ignored");
        }
    }

    fn emit(&mut self, state: OtaState) -> ControlFlow<()> {
        let from = self.state.replace(state);
        info!(from = ?from, to = %state, "ota state");
        self.sink.on_event(&OtaEvent::State { from, to: state })
    }

    fn notify(&mut self, state: OtaState) {
        if self.emit(state).is_break() {
            debug!(%state, "break ignored outside commit");
        }
    }
}
