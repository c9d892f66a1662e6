// src/monitor.rs
//! Liveness monitoring primitives.
//!
//! Local principal monitors and transport link monitors both deliver the
//! same `Down` shape, so the registrar consumes one event kind no matter
//! which side failed.

use crate::principal::PrincipalRef;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Opaque token identifying one monitor registration. Unique for the
/// lifetime of the process, across all monitor sources.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct MonitorHandle(u64);

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

impl MonitorHandle {
    /// Allocate a fresh handle.
    pub(crate) fn next() -> Self {
        Self(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
    }
}

/// Why a monitored principal went away.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExitReason {
    /// The principal's handler returned.
    Normal,
    /// Forcibly terminated via a kill signal.
    Killed,
    /// The principal's task panicked.
    Panic,
    /// The principal was already gone when the monitor was installed.
    NoProc,
    /// The transport link to the principal's node closed.
    Disconnected,
}

/// Delivered once per monitor when the watched principal terminates.
#[derive(Clone, Debug)]
pub struct Down {
    pub handle: MonitorHandle,
    pub principal: PrincipalRef,
    pub reason: ExitReason,
}

/// Where `Down` notifications are delivered.
pub type DownSink = mpsc::UnboundedSender<Down>;
