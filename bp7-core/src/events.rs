//! Host event and telemetry proxies. The embedding host registers reporter
//! callbacks at init; missing callbacks are tolerated and surface as
//! `NullCallback` so callers can ignore them.

use crate::error::{BpError, BpResult};
use std::sync::Arc;
use tracing::debug;

/// Closed set of host-visible event identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventId {
    Noop,
    VerifBundleSuccess,
    VerifBundleErr,
    InitBundleStorSuccess,
    InitBundleStorErr,
    ContactSetupSuccess,
    ContactSetupErr,
    ContactTeardown,
    IntfUp,
    IntfDown,
    CustodyAccepted,
    CustodyReleased,
    BundleDiscarded,
    TimeSyncAcquired,
    TimeSyncLost,
    StorageOffloadErr,
}

/// Host callback receiving events.
pub trait EventReporter: Send + Sync {
    fn report(&self, event: EventId, detail: &str);
}

/// Host callback receiving counter samples.
pub trait TelemetryReporter: Send + Sync {
    fn counter(&self, name: &'static str, value: u64);
}

/// Per-error-kind occurrence counters, the MIB view of section-level error
/// reporting.
#[derive(Debug, Default)]
pub struct ErrorCounters {
    counts: [std::sync::atomic::AtomicU64; 11],
}

impl ErrorCounters {
    fn slot(err: BpError) -> usize {
        match err {
            BpError::NullPointer => 0,
            BpError::OutOfMemory => 1,
            BpError::InvalidCrc => 2,
            BpError::Duplicate => 3,
            BpError::UnknownType(_) => 4,
            BpError::Timeout => 5,
            BpError::TableOutOfRange => 6,
            BpError::NullCallback => 7,
            BpError::Codec(_) => 8,
            BpError::InterfaceDown => 9,
            BpError::Fatal(_) => 10,
        }
    }

    pub fn record(&self, err: BpError) {
        self.counts[Self::slot(err)].fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn count(&self, err: BpError) -> u64 {
        self.counts[Self::slot(err)].load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// The registered host callbacks, all optional, plus the error MIB.
#[derive(Default, Clone)]
pub struct HostProxies {
    event: Option<Arc<dyn EventReporter>>,
    telemetry: Option<Arc<dyn TelemetryReporter>>,
    errors: Arc<ErrorCounters>,
}

impl HostProxies {
    pub fn new(
        event: Option<Arc<dyn EventReporter>>,
        telemetry: Option<Arc<dyn TelemetryReporter>>,
    ) -> Self {
        Self {
            event,
            telemetry,
            errors: Arc::new(ErrorCounters::default()),
        }
    }

    /// Forwards to the host event callback if one is registered.
    pub fn report_event(&self, event: EventId, detail: &str) -> BpResult<()> {
        debug!(?event, detail, "event");
        match &self.event {
            Some(cb) => {
                cb.report(event, detail);
                Ok(())
            }
            None => Err(BpError::NullCallback),
        }
    }

    /// Counts an error occurrence in the MIB.
    pub fn record_error(&self, err: BpError) {
        self.errors.record(err);
    }

    pub fn error_counters(&self) -> &ErrorCounters {
        &self.errors
    }

    /// Forwards a counter sample to the host telemetry callback.
    pub fn report_counter(&self, name: &'static str, value: u64) -> BpResult<()> {
        match &self.telemetry {
            Some(cb) => {
                cb.counter(name, value);
                Ok(())
            }
            None => Err(BpError::NullCallback),
        }
    }
}

impl std::fmt::Debug for HostProxies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostProxies")
            .field("event", &self.event.is_some())
            .field("telemetry", &self.telemetry.is_some())
            .finish()
    }
}
