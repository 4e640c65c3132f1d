//! Upgrade notifications
//!
//! Every state transition, progress step and the final verdict of an attempt
//! is delivered to an [`EventSink`]. A sink can stop a staged (recovery)
//! install at the `Uploading` transition by returning [`ControlFlow::Break`],
//! before the staged image is flagged for the boot loader.

use std::ops::ControlFlow;

use serde::{Deserialize, Serialize};

/// Externally visible attempt state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OtaState {
    /// Idle, ready for an attempt
    Init,
    /// Attempt started
    InitFinished,
    /// Erasing destination partitions
    Prepare,
    /// Erase pass finished
    PrepareDone,
    /// The attempt resumes a previous one
    BreakpointReport,
    /// Transfer running
    Running,
    /// A file is being written
    FileWrite,
    /// A file has been written
    FileWriteDone,
    /// A file is being verified
    FileVerify,
    /// A file passed verification
    FileVerifyDone,
    /// The new image is about to become authoritative
    Uploading,
    /// Attempt finished successfully
    Done,
    /// Attempt failed
    Fail,
    /// Attempt cancelled before it started
    Cancel,
}

impl std::fmt::Display for OtaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OtaState::Init => "init",
            OtaState::InitFinished => "init_finished",
            OtaState::Prepare => "prepare",
            OtaState::PrepareDone => "prepare_done",
            OtaState::BreakpointReport => "breakpoint_report",
            OtaState::Running => "running",
            OtaState::FileWrite => "file_write",
            OtaState::FileWriteDone => "file_write_done",
            OtaState::FileVerify => "file_verify",
            OtaState::FileVerifyDone => "file_verify_done",
            OtaState::Uploading => "uploading",
            OtaState::Done => "done",
            OtaState::Fail => "fail",
            OtaState::Cancel => "cancel",
        };
        f.write_str(name)
    }
}

/// One notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OtaEvent {
    /// State transition; `from` is `None` for the first event of an engine
    State {
        /// Previous state
        from: Option<OtaState>,
        /// New state
        to: OtaState,
    },
    /// Transfer progress in percent
    Progress(u8),
    /// Final verdict on the received image
    ImageValid(bool),
}

/// Receiver of upgrade notifications.
///
/// Called from the thread running the attempt and, for progress, from the
/// reader thread.
pub trait EventSink: Send + Sync {
    /// Handle `event`. Returning `Break` on a transition to
    /// [`OtaState::Uploading`] aborts a staged install; elsewhere it is
    /// ignored.
    fn on_event(&self, event: &OtaEvent) -> ControlFlow<()>;
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn on_event(&self, _event: &OtaEvent) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }
}

impl EventSink for crossbeam::channel::Sender<OtaEvent> {
    fn on_event(&self, event: &OtaEvent) -> ControlFlow<()> {
        // A dropped receiver only means nobody is listening.
        if self.send(*event).is_err() {
            tracing::trace!(?event, "event receiver dropped");
        }
        ControlFlow::Continue(())
    }
}

impl EventSink for tokio::sync::broadcast::Sender<OtaEvent> {
    fn on_event(&self, event: &OtaEvent) -> ControlFlow<()> {
        if self.send(*event).is_err() {
            tracing::trace!(?event, "no event subscribers");
        }
        ControlFlow::Continue(())
    }
}
