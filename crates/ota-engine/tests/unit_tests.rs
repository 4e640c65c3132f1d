//! Unit tests for the public building blocks of the update engine

use std::sync::Arc;

use anyhow::Result;
use ota_engine::breakpoint::{BreakpointJournal, CurrentFile, is_ota_running, read_breakpoint};
use ota_engine::prelude::*;
use ota_engine::storage::OtaStorage;
use ota_engine::upgrade::{other_writing_partition, read_status, set_other_writing};
use ota_test_helpers::prelude::*;
use tempfile::TempDir;

// =========================================================================
// Configuration
// =========================================================================

#[test]
fn test_config_json_fills_defaults() -> Result<()> {
    let config = OtaConfig::from_json_str(r#"{ "install_mode": "recovery", "skip_init_erase": true }"#)?;
    assert_eq!(config.install_mode, InstallMode::Recovery);
    assert!(config.skip_init_erase);
    assert_eq!(config.journal_save_granule, OtaConfig::default().journal_save_granule);
    Ok(())
}

#[test]
fn test_config_rejects_unaligned_granule() {
    let err = must_err(OtaConfig::from_json_str(r#"{ "journal_save_granule": 1000 }"#));
    assert!(err.to_string().contains("journal_save_granule"), "{err}");
}

#[test]
fn test_secure_boot_requires_recovery_mode() {
    let config = OtaConfig::default().with_secure_boot_key(TEST_VERIFYING_KEY_PEM);
    assert!(config.validate().is_err());
    let config = config.with_install_mode(InstallMode::Recovery);
    assert!(config.validate().is_ok());
}

#[test]
fn test_config_load_from_file() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("ota.json");
    std::fs::write(&path, r#"{ "no_version_control": true }"#)?;
    let config = OtaConfig::load(&path)?;
    assert!(config.no_version_control);
    Ok(())
}

// =========================================================================
// Partition tables
// =========================================================================

#[test]
fn test_partition_table_json_roundtrip_keeps_mirrors() -> Result<()> {
    let table = TableFixture::dual_bank();
    let json = serde_json::to_string(&table)?;
    let parsed = StaticPartitionTable::from_json_str(&json)?;
    assert_eq!(parsed, table);
    assert_eq!(parsed.mirror_part(file_id::SYSTEM).map(|p| p.name.as_str()), Some("system_b"));
    assert_eq!(parsed.find(file_id::SYSTEM).map(|p| p.name.as_str()), Some("system_a"));
    assert_eq!(parsed.boot_mirror_part(file_id::SYSTEM), None);
    Ok(())
}

#[test]
fn test_partition_table_rejects_overlap() {
    let table = StaticPartitionTable::new(
        0,
        vec![
            TableFixture::entry("a", PartitionType::System, file_id::SYSTEM, None, 0x1_0000, 0x2_0000),
            TableFixture::entry("b", PartitionType::Data, file_id::SDFS, None, 0x2_0000, 0x1_0000),
        ],
    );
    assert!(table.validate().is_err());
}

#[test]
fn test_recovery_table_resolves_temp_and_boot_mirror() {
    let table = TableFixture::recovery();
    assert_eq!(table.temp_part().map(|p| p.name.as_str()), Some("temp"));
    assert_eq!(table.boot_mirror_part(file_id::BOOT).map(|p| p.name.as_str()), Some("boot_b"));
    assert_eq!(table.boot_mirror_part(file_id::SYS_PARAM).map(|p| p.name.as_str()), Some("param"));
}

// =========================================================================
// Storage
// =========================================================================

#[test]
fn test_erase_skips_clean_sectors() -> Result<()> {
    let flash = SimFlash::new(0x4_0000);
    let mut storage = OtaStorage::new(Box::new(flash.clone()));
    storage.write(0x1_2000, &[0u8; 8])?;
    flash.clear_log();

    storage.erase(0x1_0000, 0x1_0000)?;
    assert_eq!(flash.erase_log(), vec![(0x1_2000, SECTOR_SIZE)]);
    assert!(storage.is_clean(0x1_0000, 0x1_0000)?);
    Ok(())
}

#[test]
fn test_erase_rejects_unaligned_range() {
    let mut storage = OtaStorage::new(Box::new(SimFlash::new(0x1_0000)));
    let err = must_err(storage.erase(0x100, SECTOR_SIZE));
    assert!(matches!(err, ota_errors::StorageError::Misaligned { .. }));
}

#[test]
fn test_calc_crc_matches_written_bytes() -> Result<()> {
    let data = ImageFixture::payload(0x2345, 3);
    let mut storage = OtaStorage::new(Box::new(SimFlash::new(0x1_0000)));
    storage.write(0x1000, &data)?;
    assert_eq!(storage.calc_crc(0x1000, data.len() as u32)?, crc32fast::hash(&data));
    Ok(())
}

#[test]
fn test_staged_image_check_ignores_erased_magic() -> Result<()> {
    let image = ImageFixture::full_image(ImageFixture::version(0x0200), 1).build()?;
    let mut staged = image.clone();
    if let Some(head) = staged.get_mut(..4) {
        head.fill(0xFF);
    }
    let mut storage = OtaStorage::new(Box::new(SimFlash::new(0x10_0000)));
    storage.write(0, &staged)?;
    storage.check_image(0)?;

    storage.write(0x1000, &[0u8; 4])?;
    assert!(storage.check_image(0).is_err());
    Ok(())
}

// =========================================================================
// Journal
// =========================================================================

#[test]
fn test_journal_survives_in_file_store() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("nv.json");

    let mut journal = BreakpointJournal::new(Box::new(FileNvStore::new(&path)), 0x2000);
    journal.load_or_init(Breakpoint::with_defaults(0x0100, 1))?;
    journal.update_state(BreakpointState::UpgradeWriting)?;
    let cur = CurrentFile {
        name: "system.bin".into(),
        file_id: file_id::SYSTEM,
        ..CurrentFile::default()
    };
    journal.update_file_state(&cur, FileState::WriteStart, 0, false)?;
    journal.update_file_state(&cur, FileState::Writing, 0x3000, true)?;

    let store = FileNvStore::new(&path);
    let status = must_some(read_status(&store)?, "stored journal");
    assert_eq!(status.state, BreakpointState::UpgradeWriting);
    assert_eq!(status.write_offset, 0x3000);
    assert_eq!(status.current_file.as_deref(), Some("system.bin"));
    assert!(is_ota_running(&store)?);
    Ok(())
}

#[test]
fn test_writing_state_saves_on_granule() -> Result<()> {
    let store = MemoryNvStore::new();
    let mut journal = BreakpointJournal::new(Box::new(store.clone()), 0x2000);
    journal.load_or_init(Breakpoint::with_defaults(0x0100, 1))?;
    let cur = CurrentFile {
        name: "sdfs.bin".into(),
        file_id: file_id::SDFS,
        ..CurrentFile::default()
    };
    journal.update_file_state(&cur, FileState::WriteStart, 0, false)?;
    let base = store.write_count();

    journal.update_file_state(&cur, FileState::Writing, 0, false)?;
    journal.update_file_state(&cur, FileState::Writing, 0x1000, false)?;
    assert_eq!(store.write_count(), base + 1);
    journal.update_file_state(&cur, FileState::Writing, 0x2000, false)?;
    assert_eq!(store.write_count(), base + 2);

    let saved = must_some(read_breakpoint(&store)?, "saved breakpoint");
    assert_eq!(saved.cur_file_write_offset, 0x2000);
    Ok(())
}

#[test]
fn test_missing_journal_reads_as_none() -> Result<()> {
    let store = MemoryNvStore::new();
    assert!(read_status(&store)?.is_none());
    assert!(!is_ota_running(&store)?);
    Ok(())
}

#[test]
fn test_other_writer_claims_idle_bank() -> Result<()> {
    let board = SimBoard::dual_bank(0x0100);
    drop(board.engine(SimBoard::config(), Arc::new(NullSink))?);

    let mut store = board.store.clone();
    let part = must_some(
        other_writing_partition(&mut store, board.table.as_ref(), false, file_id::SDFS)?,
        "claimed partition",
    );
    assert_eq!(part.name, "sdfs_b");
    let again = other_writing_partition(&mut store, board.table.as_ref(), false, file_id::SDFS)?;
    assert_eq!(again.map(|p| p.name), Some("sdfs_b".to_string()));

    let status = must_some(board.status()?, "journal");
    assert_eq!(status.state, BreakpointState::UpgradeWritingOther);
    assert!(other_writing_partition(&mut store, board.table.as_ref(), false, file_id::BOOT)?.is_none());
    Ok(())
}

#[test]
fn test_claimed_partition_is_erased_by_next_prepare() -> Result<()> {
    let board = SimBoard::dual_bank(0x0100);
    let mut store = board.store.clone();
    set_other_writing(&mut store, board.table.as_ref(), false, file_id::SDFS)?;
    board.flash.poke(0x18_0000, &[0u8; 32]);

    let image = ImageFixture::full_image(ImageFixture::version(0x0200), 4).build()?;
    let mut engine = board.engine(SimBoard::config().with_skip_init_erase(true), RecordingSink::new())?;
    engine.attach_backend(Box::new(MemoryBackend::new(image)))?;
    engine.check()?;
    assert_eq!(must_some(board.status()?, "journal").state, BreakpointState::UpgradeDone);
    Ok(())
}

#[test]
fn test_unknown_other_writer_partition_is_rejected() {
    let board = SimBoard::dual_bank(0x0100);
    let mut store = board.store.clone();
    let err = must_err(set_other_writing(&mut store, board.table.as_ref(), false, file_id::RECOVERY));
    assert!(matches!(err, OtaError::UnknownPartition { file_id: file_id::RECOVERY }));
}

// =========================================================================
// Backends
// =========================================================================

#[test]
fn test_file_backend_installs_image_from_disk() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("update.bin");
    let pkg = ImageFixture::full_image(ImageFixture::version(0x0200), 6);
    std::fs::write(&path, pkg.build()?)?;

    let board = SimBoard::dual_bank(0x0100);
    let mut engine = board.engine(SimBoard::config(), RecordingSink::new())?;
    engine.attach_backend(Box::new(FileBackend::new(&path)))?;
    assert_eq!(engine.backend_type(), BackendType::Card);
    engine.check()?;

    let sdfs = pkg.files().iter().find(|f| f.name == "sdfs.bin").map(|f| f.payload.clone());
    let sdfs = must_some(sdfs, "sdfs payload");
    assert_eq!(board.read_part("sdfs_b", sdfs.len()), sdfs);
    Ok(())
}

#[test]
fn test_memory_backend_sees_progress_and_verdict() -> Result<()> {
    let board = SimBoard::dual_bank(0x0100);
    let image = ImageFixture::full_image(ImageFixture::version(0x0200), 8).build()?;
    let backend = MemoryBackend::new(image).with_max_request_size(0x800);
    let reports = backend.reports();

    let mut engine = board.engine(SimBoard::config(), RecordingSink::new())?;
    engine.attach_backend(Box::new(backend))?;
    engine.check()?;

    let reports = reports.lock();
    assert_eq!(reports.image_valid, Some(true));
    assert_eq!(reports.progress.last(), Some(&100));
    assert!(reports.progress.windows(2).all(|w| w.first() <= w.get(1)));
    assert_eq!(reports.opens, reports.closes);
    Ok(())
}
