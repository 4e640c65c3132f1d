//! Simulated installs
//!
//! Runs one upgrade attempt against a flash image on disk. The flash file is
//! written back whatever the outcome and the journal lives in its own file,
//! so an interrupted run picks up from its breakpoint the next time (with
//! `skip_init_erase` set in the configuration).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ota_engine::backend::{FileBackend, TempPartitionBackend, TransportBackend};
use ota_engine::config::OtaConfig;
use ota_engine::event::{NullSink, OtaEvent};
use ota_engine::partition::{PartitionTable, StaticPartitionTable};
use ota_engine::platform::Platform;
use ota_engine::service::OtaService;
use ota_engine::sim::{FileNvStore, SimFlash, SimPlatform};
use ota_engine::storage::{OtaStorage, StorageStats};
use ota_engine::upgrade::{OtaUpgrade, UpgradeContext, UpgradeStatus};
use ota_engine::version::FirmwareVersion;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, info_span, warn, Instrument};

use crate::commands::SimulateArgs;
use crate::error::CliError;
use crate::output;

#[derive(Debug, Serialize)]
struct SimulationReport {
    events: Vec<OtaEvent>,
    status: UpgradeStatus,
    transfer_time: Duration,
    storage: StorageStats,
}

/// Execute simulate command
pub async fn execute(args: &SimulateArgs, json: bool) -> Result<()> {
    let config = match &args.config {
        Some(path) => OtaConfig::load(path).map_err(CliError::from)?,
        None => OtaConfig::default(),
    };
    let table = Arc::new(StaticPartitionTable::load(&args.table).map_err(CliError::from)?);
    let flash = load_flash(&args.flash, args.flash_size)?;
    let running = FirmwareVersion::new(args.running, args.running_name.clone(), args.board.clone());
    let platform = Arc::new(SimPlatform::new(running, flash.clone()));

    let backend: Box<dyn TransportBackend> = match &args.image {
        Some(image) if !args.from_temp => Box::new(FileBackend::new(image)),
        _ => Box::new(
            TempPartitionBackend::new(Arc::clone(&platform) as Arc<dyn Platform>, table.as_ref())
                .ok_or_else(|| CliError::InvalidConfiguration("partition table has no temp partition".into()))?,
        ),
    };

    let engine = OtaUpgrade::new(
        config,
        UpgradeContext {
            storage: OtaStorage::new(Box::new(flash.clone())),
            table: Arc::clone(&table) as Arc<dyn PartitionTable>,
            platform,
            store: Box::new(FileNvStore::new(&args.journal)),
            sink: Arc::new(NullSink),
        },
    )
    .map_err(CliError::from)?;

    let service = OtaService::new(engine);
    service.attach_backend(backend).map_err(CliError::from)?;
    let printer = tokio::spawn(collect_events(service.subscribe(), !json));

    let span = info_span!("simulate", flash = %args.flash.display(), journal = %args.journal.display());
    let result = run_attempt(&service).instrument(span).await;

    // Persist before reporting so a failed run can be resumed.
    std::fs::write(&args.flash, flash.snapshot())
        .with_context(|| format!("writing {}", args.flash.display()))?;

    let (status, transfer_time, storage) =
        service.with_engine(|engine| (engine.status(), engine.transfer_time(), *engine.storage_stats()));
    drop(service);
    let events = printer.await.context("event printer task failed")?;

    result.map_err(CliError::from)?;
    info!(elapsed_ms = transfer_time.as_millis(), "simulated install finished");

    if json {
        output::print_json(
            "simulation",
            &SimulationReport {
                events,
                status,
                transfer_time,
                storage,
            },
        );
    } else {
        output::print_status_human(Some(&status));
        output::print_success(&format!("Install finished in {transfer_time:.2?}"));
    }
    Ok(())
}

/// Run one attempt, cancelling it on Ctrl-C.
async fn run_attempt(service: &OtaService) -> Result<(), ota_errors::OtaError> {
    let check = service.check();
    tokio::pin!(check);
    tokio::select! {
        result = &mut check => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, cancelling the attempt");
            service.cancel();
            check.await
        }
    }
}

/// Drain `rx` until the service goes away, echoing events when `echo` is set.
async fn collect_events(mut rx: broadcast::Receiver<OtaEvent>, echo: bool) -> Vec<OtaEvent> {
    let mut events = Vec::new();
    loop {
        match rx.recv().await {
            Ok(event) => {
                if echo {
                    output::print_event_human(&event);
                }
                events.push(event);
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => warn!(missed, "event printer lagged"),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    events
}

/// Flash contents from `path`, or an erased device of `size` bytes.
fn load_flash(path: &Path, size: u32) -> Result<SimFlash> {
    match std::fs::read(path) {
        Ok(cells) => {
            info!(path = %path.display(), size = cells.len(), "flash loaded");
            Ok(SimFlash::from_bytes(cells).with_name(path.display().to_string()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), size, "creating erased flash");
            Ok(SimFlash::new(size).with_name(path.display().to_string()))
        }
        Err(e) => Err(CliError::from(e)).with_context(|| format!("reading {}", path.display())),
    }
}
