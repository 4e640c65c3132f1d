//! Integration tests for complete upgrade attempts on a simulated board

use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use ota_crypto::ImageSigningKey;
use ota_engine::image::IMAGE_MAGIC_BYTES;
use ota_engine::prelude::*;
use ota_engine::upgrade::read_status;
use ota_engine::version::FwVersionRecord;
use ota_errors::{ImageError, StorageError};
use ota_test_helpers::prelude::*;
use parking_lot::Mutex;

const OLD: u32 = 0x0100;
const NEW: u32 = 0x0200;

fn payload_of(pkg: &ImagePackager, name: &str) -> Vec<u8> {
    pkg.files()
        .iter()
        .find(|f| f.name == name)
        .map(|f| f.payload.clone())
        .unwrap_or_default()
}

fn is_written(flash: &SimFlash, offset: u32) -> bool {
    flash.slice(offset, 16).iter().any(|&b| b != 0xFF)
}

fn file_state(status: &UpgradeStatus, id: u8) -> FileState {
    status
        .files
        .iter()
        .find(|s| s.file_id == id)
        .map_or(FileState::Unknown, |s| s.state)
}

// =========================================================================
// Mirror installs
// =========================================================================

#[test]
fn test_mirror_install_writes_inactive_bank_only() -> Result<()> {
    let board = SimBoard::dual_bank(OLD);
    let pkg = ImageFixture::full_image(ImageFixture::version(NEW), 1);
    let image = pkg.build()?;
    let sink = RecordingSink::new();

    let mut engine = board.engine(SimBoard::config(), sink.clone())?;
    engine.attach_backend(Box::new(MemoryBackend::new(image)))?;
    engine.check()?;

    let system = payload_of(&pkg, "system.bin");
    let sdfs = payload_of(&pkg, "sdfs.bin");
    let boot = payload_of(&pkg, "boot.bin");
    let param = payload_of(&pkg, "param.bin");
    assert_eq!(board.read_part("system_b", system.len()), system);
    assert_eq!(board.read_part("sdfs_b", sdfs.len()), sdfs);
    assert_eq!(board.read_part("boot_b", boot.len()), boot);
    assert_eq!(board.read_part("param_b", param.len()), param);

    for live in ["system_a", "sdfs_a", "boot_a", "param_a", "evtbuf"] {
        assert!(board.is_erased(live), "{live} was touched");
    }

    let status = must_some(board.status()?, "journal after install");
    assert_eq!(status.state, BreakpointState::UpgradeDone);
    assert!(status.in_progress);
    assert_eq!(status.new_version, NEW);
    assert_eq!(file_state(&status, file_id::SYSTEM), FileState::VerifyPass);
    assert_eq!(file_state(&status, file_id::SYS_PARAM), FileState::VerifyPass);

    assert!(sink.saw(OtaState::Uploading));
    assert_eq!(sink.states().last(), Some(&OtaState::Done));
    assert_eq!(sink.image_valid(), Some(true));
    assert_eq!(sink.progress().last(), Some(&100));
    Ok(())
}

#[test]
fn test_boot_and_param_files_are_written_last() -> Result<()> {
    let board = SimBoard::dual_bank(OLD);
    let version = ImageFixture::version(NEW);
    let pkg = ImagePackager::new(version.clone())
        .file("boot.bin", PartitionType::Boot, file_id::BOOT, ImageFixture::payload(0x2000, 4))
        .file(
            "param.bin",
            PartitionType::SysParam,
            file_id::SYS_PARAM,
            ImageFixture::param_file(&version, 0x400),
        )
        .file("system.bin", PartitionType::System, file_id::SYSTEM, ImageFixture::payload(0x8000, 5))
        .file("sdfs.bin", PartitionType::Data, file_id::SDFS, ImageFixture::payload(0x3000, 6));
    let image = pkg.build()?;

    // At each FileWrite, which of system/sdfs/boot/param hold data and what
    // the saved journal says about each of them.
    type Snapshot = ([bool; 4], [FileState; 4]);
    let starts: Arc<Mutex<Vec<Snapshot>>> = Arc::new(Mutex::new(Vec::new()));
    let flash = board.flash.clone();
    let store = board.store.clone();
    let seen = Arc::clone(&starts);
    let sink = Arc::new(FnSink(move |event: &OtaEvent| {
        if let OtaEvent::State {
            to: OtaState::FileWrite,
            ..
        } = event
        {
            let states = match read_status(&store) {
                Ok(Some(status)) => [file_id::SYSTEM, file_id::SDFS, file_id::BOOT, file_id::SYS_PARAM]
                    .map(|id| file_state(&status, id)),
                _ => [FileState::Unknown; 4],
            };
            seen.lock().push((
                [
                    is_written(&flash, 0x0C_0000),
                    is_written(&flash, 0x18_0000),
                    is_written(&flash, 0x01_0000),
                    is_written(&flash, 0x03_0000),
                ],
                states,
            ));
        }
        ControlFlow::Continue(())
    }));

    let mut engine = board.engine(SimBoard::config(), sink)?;
    engine.attach_backend(Box::new(MemoryBackend::new(image)))?;
    engine.check()?;

    let starts = starts.lock().clone();
    let written: Vec<[bool; 4]> = starts.iter().map(|(w, _)| *w).collect();
    assert_eq!(
        written,
        vec![
            [false, false, false, false],
            [true, false, false, false],
            [true, true, false, false],
            [true, true, true, false],
        ]
    );

    // Boot starts once the application files verified; param starts once
    // everything else, boot included, verified.
    let (_, at_boot) = must_some(starts.get(2), "boot write start");
    let [system, sdfs, _, param] = *at_boot;
    assert_eq!([system, sdfs], [FileState::VerifyPass; 2]);
    assert!(!param.is_done(), "param started before boot: {at_boot:?}");

    let (_, at_param) = must_some(starts.get(3), "param write start");
    let [system, sdfs, boot, _] = *at_param;
    assert_eq!([system, sdfs, boot], [FileState::VerifyPass; 3]);
    Ok(())
}

#[test]
fn test_same_version_is_declined_and_engine_returns_to_init() -> Result<()> {
    let board = SimBoard::dual_bank(NEW);
    let image = ImageFixture::full_image(ImageFixture::version(NEW), 1).build()?;
    let sink = RecordingSink::new();

    let mut engine = board.engine(SimBoard::config(), sink.clone())?;
    engine.attach_backend(Box::new(MemoryBackend::new(image)))?;
    let err = must_err(engine.check());

    assert!(matches!(err, OtaError::Declined(_)), "{err}");
    assert_eq!(err.class(), ErrorClass::Declined);
    assert!(!err.is_resumable());
    assert!(sink.states().ends_with(&[OtaState::Fail, OtaState::Init]));
    assert_eq!(sink.image_valid(), Some(false));
    assert!(board.is_erased("system_b"));
    Ok(())
}

#[test]
fn test_unversioned_install_stamps_next_version() -> Result<()> {
    let board = SimBoard::dual_bank(0x0163);
    let pkg = ImageFixture::full_image(ImageFixture::version(0x0100), 2);
    let image = pkg.build()?;

    let config = SimBoard::config().with_no_version_control(true);
    let mut engine = board.engine(config, RecordingSink::new())?;
    engine.attach_backend(Box::new(MemoryBackend::new(image)))?;
    engine.check()?;

    let param = must_some(board.part("param_b"), "param_b");
    let record = FwVersionRecord::decode(&board.flash.slice(param.offset.saturating_add(0x100), 128))?;
    assert!(record.is_valid());
    assert_eq!(record.version_code, 0x0200);
    Ok(())
}

#[test]
fn test_board_mismatch_is_declined() -> Result<()> {
    let board = SimBoard::dual_bank(OLD);
    let foreign = FirmwareVersion::new(NEW, "2.0", "other-board");
    let image = ImageFixture::app_image(foreign, vec![1; 64], vec![2; 64]).build()?;

    let mut engine = board.engine(SimBoard::config(), RecordingSink::new())?;
    engine.attach_backend(Box::new(MemoryBackend::new(image)))?;
    let err = must_err(engine.check());
    assert!(err.to_string().contains("other-board"), "{err}");
    Ok(())
}

#[test]
fn test_check_without_backend_fails() -> Result<()> {
    let board = SimBoard::dual_bank(OLD);
    let mut engine = board.engine(SimBoard::config(), RecordingSink::new())?;
    assert!(matches!(must_err(engine.check()), OtaError::BackendUnavailable));
    Ok(())
}

#[test]
fn test_attaching_a_different_backend_kind_is_refused() -> Result<()> {
    let board = SimBoard::dual_bank(OLD);
    let mut engine = board.engine(SimBoard::config(), RecordingSink::new())?;
    engine.attach_backend(Box::new(MemoryBackend::new(vec![0u8; 16])))?;

    let usb = FaultyBackend::new(vec![0u8; 16]).with_backend_type(BackendType::Usb);
    let err = must_err(engine.attach_backend(Box::new(usb)));
    assert!(matches!(err, OtaError::BackendBusy { .. }));

    // Same kind replaces the bound transport.
    engine.attach_backend(Box::new(MemoryBackend::new(vec![1u8; 16])))?;
    assert!(engine.detach_backend().is_some());
    Ok(())
}

#[test]
fn test_garbage_image_reports_cancel() -> Result<()> {
    let board = SimBoard::dual_bank(OLD);
    let sink = RecordingSink::new();
    let mut engine = board.engine(SimBoard::config(), sink.clone())?;
    engine.attach_backend(Box::new(MemoryBackend::new(vec![0x5Au8; 0x800])))?;

    let err = must_err(engine.check());
    assert_eq!(err.class(), ErrorClass::Format);
    assert_eq!(sink.states().last(), Some(&OtaState::Cancel));
    Ok(())
}

#[test]
fn test_bad_header_checksum_fails_open_without_writes() -> Result<()> {
    let board = SimBoard::dual_bank(OLD);
    let mut image = ImageFixture::full_image(ImageFixture::version(NEW), 4).build()?;
    if let Some(b) = image.get_mut(0x40) {
        *b ^= 0x01;
    }
    let programs = board.flash.program_count();

    let mut engine = board.engine(SimBoard::config(), RecordingSink::new())?;
    engine.attach_backend(Box::new(MemoryBackend::new(image)))?;
    let err = must_err(engine.check());
    assert!(matches!(err, OtaError::Image(ImageError::HeaderChecksum { .. })), "{err}");
    assert_eq!(board.flash.program_count(), programs);
    Ok(())
}

// =========================================================================
// Interrupted attempts
// =========================================================================

#[test]
fn test_transport_timeout_resumes_from_saved_offset() -> Result<()> {
    let board = SimBoard::dual_bank(OLD);
    let pkg = ImageFixture::full_image(ImageFixture::version(NEW), 7);
    let link = FaultyBackend::new(pkg.build()?).failing_from(0x1_0000);
    let sink = RecordingSink::new();

    let config = SimBoard::config().with_journal_save_granule(0x2000);
    let mut engine = board.engine(config, sink.clone())?;
    engine.attach_backend(Box::new(link.clone()))?;

    let err = must_err(engine.check());
    assert!(err.is_resumable(), "{err}");
    assert_eq!(sink.states().last(), Some(&OtaState::Init));

    let status = must_some(board.status()?, "journal after timeout");
    assert_eq!(status.state, BreakpointState::UpgradeWriting);
    assert_eq!(status.current_file.as_deref(), Some("system.bin"));
    assert!(status.write_offset > 0);
    assert_eq!(file_state(&status, file_id::SYSTEM), FileState::Writing);

    link.heal();
    sink.clear();
    engine.check()?;

    assert!(sink.saw(OtaState::BreakpointReport));
    let system = payload_of(&pkg, "system.bin");
    assert_eq!(board.read_part("system_b", system.len()), system);
    let first = sink.progress().first().copied().unwrap_or_default();
    assert!(first > 0, "progress restarted from zero");
    Ok(())
}

#[test]
fn test_power_cut_mid_file_resumes_after_reboot() -> Result<()> {
    let mut board = SimBoard::dual_bank(OLD);
    let pkg = ImageFixture::full_image(ImageFixture::version(NEW), 11);
    let image = pkg.build()?;
    let config = SimBoard::config().with_journal_save_granule(0x2000);

    board.arm_power_cut(0x8000);
    let mut engine = board.engine(config.clone(), RecordingSink::new())?;
    engine.attach_backend(Box::new(MemoryBackend::new(image.clone())))?;
    assert!(engine.check().is_err());
    assert!(board.cut.is_tripped());
    drop(engine);

    let status = must_some(board.status()?, "journal after power cut");
    assert_eq!(status.state, BreakpointState::UpgradeWriting);
    assert!(status.write_offset > 0 && status.write_offset <= 0x8000);

    board.reboot();
    let sink = RecordingSink::new();
    let mut engine = board.engine(config.with_skip_init_erase(true), sink.clone())?;
    engine.attach_backend(Box::new(MemoryBackend::new(image)))?;
    engine.check()?;

    assert!(sink.saw(OtaState::BreakpointReport));
    for (name, part) in [("system.bin", "system_b"), ("sdfs.bin", "sdfs_b"), ("boot.bin", "boot_b")] {
        let data = payload_of(&pkg, name);
        assert_eq!(board.read_part(part, data.len()), data, "{part}");
    }
    Ok(())
}

#[test]
fn test_resume_skips_finished_file_and_erases_only_above_offset() -> Result<()> {
    let mut board = SimBoard::dual_bank(OLD);
    let sdfs = ImageFixture::payload(0x8000, 21);
    let system = ImageFixture::payload(0x8_0000, 22);
    let pkg = ImagePackager::new(ImageFixture::version(NEW))
        .file("sdfs.bin", PartitionType::Data, file_id::SDFS, sdfs.clone())
        .file("system.bin", PartitionType::System, file_id::SYSTEM, system.clone());
    let image = pkg.build()?;
    let config = SimBoard::config().with_journal_save_granule(0x1_0000);

    // sdfs completes, system dies a little past 192 KiB.
    board.arm_power_cut(0x8000 + 0x3_0000 + 0x800);
    let mut engine = board.engine(config.clone(), RecordingSink::new())?;
    engine.attach_backend(Box::new(MemoryBackend::new(image.clone())))?;
    assert!(engine.check().is_err());
    drop(engine);

    let status = must_some(board.status()?, "journal after power cut");
    assert_eq!(file_state(&status, file_id::SDFS), FileState::VerifyPass);
    assert_eq!(file_state(&status, file_id::SYSTEM), FileState::Writing);
    assert_eq!(status.write_offset, 0x3_0000);

    board.reboot();
    board.flash.clear_log();
    let sink = RecordingSink::new();
    let mut engine = board.engine(config.with_skip_init_erase(true), sink.clone())?;
    engine.attach_backend(Box::new(MemoryBackend::new(image)))?;
    engine.check()?;

    let sdfs_b = must_some(board.part("sdfs_b"), "sdfs_b");
    let system_b = must_some(board.part("system_b"), "system_b");
    let resume_at = system_b.offset + 0x3_0000;
    for (offset, len) in board.flash.erase_log() {
        assert!(offset >= resume_at || offset + len <= system_b.offset, "re-erased {offset:#x}+{len:#x}");
        assert!(offset + len <= sdfs_b.offset || offset >= sdfs_b.end(), "sdfs re-erased at {offset:#x}");
    }
    assert_eq!(board.read_part("system_b", system.len()), system);
    assert_eq!(board.read_part("sdfs_b", sdfs.len()), sdfs);
    Ok(())
}

#[test]
fn test_user_cancel_is_resumable() -> Result<()> {
    let board = SimBoard::dual_bank(OLD);
    let pkg = ImageFixture::full_image(ImageFixture::version(NEW), 3);
    let image = pkg.build()?;

    let mut engine = board.engine(SimBoard::config(), RecordingSink::new())?;
    let link = FaultyBackend::new(image.clone()).cancelling_at(0x8000, engine.cancel_handle());
    engine.attach_backend(Box::new(link))?;
    let err = must_err(engine.check());
    assert_eq!(err.class(), ErrorClass::Cancelled);

    engine.attach_backend(Box::new(MemoryBackend::new(image)))?;
    engine.check()?;
    let system = payload_of(&pkg, "system.bin");
    assert_eq!(board.read_part("system_b", system.len()), system);
    Ok(())
}

#[test]
fn test_cancel_between_attempts_stops_the_next_one() -> Result<()> {
    let board = SimBoard::dual_bank(OLD);
    let pkg = ImageFixture::full_image(ImageFixture::version(NEW), 29);
    let image = pkg.build()?;

    let sink = RecordingSink::new();
    let mut engine = board.engine(SimBoard::config(), sink.clone())?;
    engine.attach_backend(Box::new(MemoryBackend::new(image)))?;
    engine.cancel_read();

    let err = must_err(engine.check());
    assert!(matches!(err, OtaError::Image(ImageError::Cancelled)), "{err}");
    assert!(err.is_resumable());
    assert!(sink.saw(OtaState::Cancel));
    assert_eq!(board.flash.program_count(), 0);

    engine.check()?;
    let system = payload_of(&pkg, "system.bin");
    assert_eq!(board.read_part("system_b", system.len()), system);
    Ok(())
}

#[test]
fn test_corruption_during_verify_fails_and_next_attempt_starts_over() -> Result<()> {
    let board = SimBoard::dual_bank(OLD);
    let pkg = ImageFixture::full_image(ImageFixture::version(NEW), 5);
    let image = pkg.build()?;

    let flash = board.flash.clone();
    let armed = Arc::new(AtomicBool::new(true));
    let trigger = Arc::clone(&armed);
    let sink = Arc::new(FnSink(move |event: &OtaEvent| {
        if matches!(event, OtaEvent::State { to: OtaState::FileVerify, .. }) && trigger.swap(false, Ordering::SeqCst) {
            flash.poke(0x0C_0010, &[0x00, 0x11, 0x22, 0x33]);
        }
        ControlFlow::Continue(())
    }));

    let mut engine = board.engine(SimBoard::config(), sink)?;
    engine.attach_backend(Box::new(MemoryBackend::new(image)))?;
    let err = must_err(engine.check());
    assert!(matches!(err, OtaError::VerifyFailed { .. }), "{err}");
    assert_eq!(err.class(), ErrorClass::Integrity);

    let status = must_some(board.status()?, "journal after verify failure");
    assert_eq!(status.state, BreakpointState::UpgradingFail);
    assert_eq!(file_state(&status, file_id::SYSTEM), FileState::VerifyFail);

    engine.check()?;
    let system = payload_of(&pkg, "system.bin");
    assert_eq!(board.read_part("system_b", system.len()), system);
    assert_eq!(must_some(board.status()?, "journal").state, BreakpointState::UpgradeDone);
    Ok(())
}

#[test]
fn test_flash_write_failure_fails_file_and_retry_erases_it_whole() -> Result<()> {
    let board = SimBoard::dual_bank(OLD);
    let pkg = ImageFixture::full_image(ImageFixture::version(NEW), 27);
    let image = pkg.build()?;
    let system_b = must_some(board.part("system_b"), "system_b");
    let config = SimBoard::config().with_journal_save_granule(0x1_0000);

    // system.bin goes first; its program fails a little past 64 KiB.
    let flash = board.faulty_flash().with_write_failure_at(system_b.offset + 0x1_0800);
    let sink = RecordingSink::new();
    let mut engine = board.engine_over(flash, config.clone(), sink.clone())?;
    engine.attach_backend(Box::new(MemoryBackend::new(image.clone())))?;
    let err = must_err(engine.check());
    drop(engine);

    assert!(matches!(err, OtaError::Storage(StorageError::Write { .. })), "{err}");
    assert_eq!(err.class(), ErrorClass::FlashIo);
    assert!(!err.is_resumable());
    assert_eq!(sink.states().last(), Some(&OtaState::Fail));
    assert_eq!(sink.image_valid(), Some(false));

    let status = must_some(board.status()?, "journal after program failure");
    assert_eq!(status.state, BreakpointState::UpgradingFail);
    assert_eq!(file_state(&status, file_id::SYSTEM), FileState::WriteFail);
    assert!(is_written(&board.flash, system_b.offset));

    board.flash.clear_log();
    let mut engine = board.engine(config.with_skip_init_erase(true), RecordingSink::new())?;
    engine.attach_backend(Box::new(MemoryBackend::new(image)))?;
    engine.check()?;

    let erases = board.flash.erase_log();
    assert!(
        erases.iter().any(|&(offset, _)| offset == system_b.offset),
        "system_b head not re-erased: {erases:x?}"
    );
    let system = payload_of(&pkg, "system.bin");
    assert_eq!(board.read_part("system_b", system.len()), system);
    let status = must_some(board.status()?, "journal after retry");
    assert_eq!(status.state, BreakpointState::UpgradeDone);
    assert_eq!(file_state(&status, file_id::SYSTEM), FileState::VerifyPass);
    Ok(())
}

#[test]
fn test_erase_failure_during_initial_prepare_is_a_flash_error() -> Result<()> {
    let board = SimBoard::dual_bank(OLD);
    let system_b = must_some(board.part("system_b"), "system_b");
    board.flash.poke(system_b.offset, &[0x00]);

    let flash = board.faulty_flash().with_erase_failure();
    let err = must_err(board.engine_over(flash, SimBoard::config(), RecordingSink::new()));

    assert!(matches!(err, OtaError::Storage(StorageError::Erase { .. })), "{err}");
    assert_eq!(err.class(), ErrorClass::FlashIo);
    assert_eq!(board.flash.slice(system_b.offset, 1), vec![0x00]);
    Ok(())
}

#[test]
fn test_reload_with_skip_init_erase_keeps_the_journal() -> Result<()> {
    let board = SimBoard::dual_bank(OLD);
    let image = ImageFixture::full_image(ImageFixture::version(NEW), 9).build()?;

    let mut engine = board.engine(SimBoard::config(), RecordingSink::new())?;
    engine.attach_backend(Box::new(MemoryBackend::new(image)))?;
    engine.check()?;
    drop(engine);

    let engine = board.engine(SimBoard::config().with_skip_init_erase(true), RecordingSink::new())?;
    assert!(engine.is_in_progress());
    assert!(!board.is_erased("system_b"));

    // A plain restart wipes the inactive bank again.
    let engine = board.engine(SimBoard::config(), RecordingSink::new())?;
    assert!(!engine.is_in_progress());
    assert!(board.is_erased("system_b"));
    Ok(())
}

// =========================================================================
// Patch images
// =========================================================================

#[test]
fn test_patch_image_rebuilds_from_running_bank() -> Result<()> {
    let board = SimBoard::dual_bank(OLD);
    let old = ImageFixture::payload(0x1_0000, 21);
    let mut new = old.clone();
    for (i, b) in new.iter_mut().enumerate().step_by(1500) {
        *b = (i as u8) ^ 0xA5;
    }
    new.extend_from_slice(&ImageFixture::payload(0x800, 22));
    board.flash.poke(0x04_0000, &old);

    let pkg = ImagePackager::new(ImageFixture::version(NEW))
        .with_old_version(ImageFixture::version(OLD))
        .patch_file("system.bin", PartitionType::System, file_id::SYSTEM, &old, &new);
    assert!(pkg.files().iter().all(|f| f.payload.len() < new.len()));

    let mut engine = board.engine(SimBoard::config(), RecordingSink::new())?;
    engine.attach_backend(Box::new(MemoryBackend::new(pkg.build()?)))?;
    engine.check()?;

    assert_eq!(board.read_part("system_b", new.len()), new);
    assert_eq!(board.read_part("system_a", old.len()), old);
    Ok(())
}

#[test]
fn test_patch_for_other_source_version_is_declined() -> Result<()> {
    let board = SimBoard::dual_bank(OLD);
    let pkg = ImagePackager::new(ImageFixture::version(NEW))
        .with_old_version(ImageFixture::version(0x0180))
        .patch_file("system.bin", PartitionType::System, file_id::SYSTEM, &[1; 64], &[2; 64]);

    let mut engine = board.engine(SimBoard::config(), RecordingSink::new())?;
    engine.attach_backend(Box::new(MemoryBackend::new(pkg.build()?)))?;
    let err = must_err(engine.check());
    assert!(matches!(err, OtaError::Declined(_)), "{err}");
    assert!(board.is_erased("system_b"));
    assert_eq!(board.flash.program_count(), 0);
    Ok(())
}

// =========================================================================
// Recovery installs
// =========================================================================

fn recovery_config() -> OtaConfig {
    SimBoard::config().with_install_mode(InstallMode::Recovery)
}

#[test]
fn test_recovery_stages_image_then_app_stage_installs_it() -> Result<()> {
    let board = SimBoard::recovery(OLD);
    let pkg = ImageFixture::full_image(ImageFixture::version(NEW), 13);
    let image = pkg.build()?;
    let sink = RecordingSink::new();

    let mut engine = board.engine(recovery_config(), sink.clone())?;
    engine.attach_backend(Box::new(MemoryBackend::new(image.clone())))?;
    engine.check()?;
    drop(engine);

    assert_eq!(board.read_part("temp", image.len()), image);
    assert_eq!(board.read_part("temp", 4), IMAGE_MAGIC_BYTES.to_vec());
    let boot = payload_of(&pkg, "boot.bin");
    assert_eq!(board.read_part("boot_b", boot.len()), boot);
    let param = payload_of(&pkg, "param.bin");
    assert_eq!(board.read_part("param", param.len()), param);
    assert!(board.is_erased("system"));
    assert_eq!(must_some(board.status()?, "journal").state, BreakpointState::UpgradePending);
    assert!(sink.saw(OtaState::Uploading));

    // Boot into recovery and install the staged image.
    let mut app = board.clone();
    app.table = Arc::new(TableFixture::recovery().with_current_file_id(file_id::RECOVERY));
    let config = SimBoard::config().with_install_mode(InstallMode::RecoveryApp);
    let mut engine = app.engine(config, RecordingSink::new())?;
    let staged = must_some(
        TempPartitionBackend::new(Arc::clone(&app.platform) as Arc<dyn Platform>, app.table.as_ref()),
        "temp backend",
    );
    engine.attach_backend(Box::new(staged))?;
    engine.check()?;

    let system = payload_of(&pkg, "system.bin");
    assert_eq!(app.read_part("system", system.len()), system);
    let sdfs = payload_of(&pkg, "sdfs.bin");
    assert_eq!(app.read_part("sdfs", sdfs.len()), sdfs);
    assert!(app.is_erased("recovery"));
    assert_eq!(must_some(app.status()?, "journal").state, BreakpointState::UpgradeDone);
    Ok(())
}

#[test]
fn test_recovery_commit_can_be_stopped_at_uploading() -> Result<()> {
    let board = SimBoard::recovery(OLD);
    let image = ImageFixture::full_image(ImageFixture::version(NEW), 15).build()?;

    let mut engine = board.engine(recovery_config(), RecordingSink::breaking_on(OtaState::Uploading))?;
    engine.attach_backend(Box::new(MemoryBackend::new(image)))?;
    let err = must_err(engine.check());

    assert!(matches!(err, OtaError::Aborted));
    assert_eq!(board.read_part("temp", 4), vec![0xFF; 4]);
    assert_ne!(must_some(board.status()?, "journal").state, BreakpointState::UpgradePending);
    Ok(())
}

#[test]
fn test_signed_recovery_image_verifies() -> Result<()> {
    let board = SimBoard::recovery(OLD);
    let key = ImageSigningKey::from_pem(TEST_SIGNING_KEY_PEM)?;
    let image = ImageFixture::full_image(ImageFixture::version(NEW), 17)
        .with_signer(key)
        .build()?;

    let config = recovery_config().with_secure_boot_key(TEST_VERIFYING_KEY_PEM);
    let mut engine = board.engine(config, RecordingSink::new())?;
    engine.attach_backend(Box::new(MemoryBackend::new(image.clone())))?;
    engine.check()?;

    assert_eq!(board.read_part("temp", image.len()), image);
    Ok(())
}

#[test]
fn test_bad_signature_erases_staged_head() -> Result<()> {
    let board = SimBoard::recovery(OLD);
    let key = ImageSigningKey::from_pem(TEST_SIGNING_KEY_PEM)?;
    let mut image = ImageFixture::full_image(ImageFixture::version(NEW), 19)
        .with_signer(key)
        .build()?;
    if let Some(last) = image.last_mut() {
        *last ^= 0xFF;
    }

    let config = recovery_config().with_secure_boot_key(TEST_VERIFYING_KEY_PEM);
    let sink = RecordingSink::new();
    let mut engine = board.engine(config, sink.clone())?;
    engine.attach_backend(Box::new(MemoryBackend::new(image)))?;
    let err = must_err(engine.check());

    assert!(matches!(err, OtaError::Signature(_)), "{err}");
    assert!(board.read_part("temp", 0x1000).iter().all(|&b| b == 0xFF));
    assert_eq!(must_some(board.status()?, "journal").state, BreakpointState::WritingImgFail);
    assert_eq!(sink.image_valid(), Some(false));
    Ok(())
}

// =========================================================================
// Async service
// =========================================================================

#[tokio::test]
async fn test_service_runs_attempt_and_broadcasts_events() -> Result<()> {
    let board = SimBoard::dual_bank(OLD);
    let image = ImageFixture::full_image(ImageFixture::version(NEW), 23).build()?;

    let service = OtaService::new(board.engine(SimBoard::config(), Arc::new(NullSink))?);
    let mut events = service.subscribe();
    service.attach_backend(Box::new(MemoryBackend::new(image)))?;
    assert!(!service.is_in_progress());

    service.check().await?;

    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let OtaEvent::State { to, .. } = event {
            states.push(to);
        }
    }
    assert!(states.contains(&OtaState::Running));
    assert_eq!(states.last(), Some(&OtaState::Done));
    assert!(service.is_in_progress());
    let status = must_some(service.status(), "idle engine status");
    assert_eq!(status.state, BreakpointState::UpgradeDone);
    Ok(())
}

#[tokio::test]
async fn test_service_cancel_flag_stops_the_attempt() -> Result<()> {
    let board = SimBoard::dual_bank(OLD);
    let image = ImageFixture::full_image(ImageFixture::version(NEW), 25).build()?;

    let service = OtaService::new(board.engine(SimBoard::config(), Arc::new(NullSink))?);
    let link = FaultyBackend::new(image).cancelling_at(0x4000, service.with_engine(|e| e.cancel_handle()));
    service.attach_backend(Box::new(link))?;

    let err = must_err(service.check().await);
    assert!(err.is_resumable());
    Ok(())
}
