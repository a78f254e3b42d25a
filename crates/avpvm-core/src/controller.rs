//! Lifecycle controller.
//!
//! One controller drives one virtual machine through
//!
//! ```text
//! Unconfigured -> Configured -> Starting -> Running -> Stopping -> Stopped
//!                                   \           \
//!                                    +-----------+--> Failed
//! ```
//!
//! Every transition happens behind a single mutex. The caller's `start`, the
//! runtime's callbacks and `stop_by_user_request` may run on different threads
//! at the same time; none of them holds the lock while calling into the
//! runtime, so a runtime that reports back synchronously cannot deadlock.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, oneshot};

use crate::boot::{BootDescriptor, StartOptions};
use crate::config::{ConfigurationRecord, VmParameters, ensure_port_available};
use crate::error::{Result, RuntimeError, VmError};
use crate::event::{EventSink, StopReason, VmEvent};
use crate::identity::{IdentityRegistry, LeaseOwner};
use crate::runtime::{RuntimeDelegate, RuntimeHandle, RuntimeSubmission, VmRuntime};

// ============================================================================
// VM State
// ============================================================================

/// Lifecycle state of the virtual machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmState {
    /// No validated configuration.
    Unconfigured,
    /// Configuration validated, ready to start.
    Configured,
    /// Submitted to the runtime, waiting for the start to complete.
    Starting,
    /// Running.
    Running,
    /// Stop requested, waiting for the runtime to confirm.
    Stopping,
    /// Stopped.
    Stopped,
    /// Failed; configure again before the next start.
    Failed,
}

impl VmState {
    /// Whether an instance is live in the runtime.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }

    /// Whether the instance reached an end state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unconfigured => "unconfigured",
            Self::Configured => "configured",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Shared State
// ============================================================================

type StartWaiter = oneshot::Sender<std::result::Result<(), RuntimeError>>;

/// Live runtime instance.
struct VmInstance {
    handle: Arc<dyn RuntimeHandle>,
}

struct Inner {
    state: VmState,
    record: Option<Arc<ConfigurationRecord>>,
    /// Start attempt counter; callbacks carry the value they were issued for.
    session: u64,
    instance: Option<VmInstance>,
    /// Armed before submission, released exactly once by the start outcome.
    start_waiter: Option<StartWaiter>,
    /// A stop arrived before the runtime could act on it.
    stop_deferred: bool,
    last_error: Option<RuntimeError>,
}

impl Inner {
    fn set_state(&mut self, state: VmState) {
        tracing::debug!(session = self.session, "state: {} -> {}", self.state, state);
        self.state = state;
    }

    fn fail(&mut self, error: RuntimeError) {
        self.instance = None;
        self.stop_deferred = false;
        self.last_error = Some(error);
        self.set_state(VmState::Failed);
    }

    /// Returns the handle to stop if a deferred stop can be issued now.
    ///
    /// That is the case once the start succeeded and the handle is known.
    fn take_deferred_stop(&mut self) -> Option<Arc<dyn RuntimeHandle>> {
        if !self.stop_deferred || self.state != VmState::Stopping || self.start_waiter.is_some() {
            return None;
        }
        let handle = Arc::clone(&self.instance.as_ref()?.handle);
        self.stop_deferred = false;
        Some(handle)
    }
}

/// State shared between the controller and the runtime delegates.
pub(crate) struct Shared {
    inner: Mutex<Inner>,
    events: EventSink,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn attach_instance(&self, session: u64, handle: Arc<dyn RuntimeHandle>) {
        let deferred = {
            let mut inner = self.lock();
            if inner.session != session || !inner.state.is_active() {
                tracing::debug!(session, state = %inner.state, "instance ended before attach");
                return;
            }
            inner.instance = Some(VmInstance { handle });
            inner.take_deferred_stop()
        };

        if let Some(handle) = deferred {
            tracing::info!(session, "issuing deferred stop");
            handle.request_stop();
        }
    }

    pub(crate) fn on_start_completed(
        &self,
        session: u64,
        result: std::result::Result<(), RuntimeError>,
    ) {
        let (waiter, deferred) = {
            let mut inner = self.lock();
            if inner.session != session {
                tracing::warn!(session, current = inner.session, "ignoring stale start completion");
                return;
            }
            let Some(waiter) = inner.start_waiter.take() else {
                tracing::warn!(session, "ignoring duplicate start completion");
                return;
            };

            match &result {
                Ok(()) => {
                    if inner.state == VmState::Starting {
                        inner.set_state(VmState::Running);
                    }
                    tracing::info!(session, state = %inner.state, "virtual machine started");
                }
                Err(error) => {
                    tracing::error!(session, %error, "virtual machine failed to start");
                    if matches!(inner.state, VmState::Starting | VmState::Stopping) {
                        inner.fail(error.clone());
                    }
                }
            }

            (waiter, inner.take_deferred_stop())
        };

        if let Some(handle) = deferred {
            tracing::info!(session, "issuing deferred stop");
            handle.request_stop();
        }
        let _ = waiter.send(result);
    }

    pub(crate) fn on_guest_stopped(&self, session: u64) {
        let mut inner = self.lock();
        if inner.session != session {
            tracing::warn!(session, current = inner.session, "ignoring stale stop event");
            return;
        }
        if !inner.state.is_active() {
            tracing::debug!(session, state = %inner.state, "ignoring stop event");
            return;
        }

        let reason = if inner.state == VmState::Stopping {
            StopReason::UserRequest
        } else {
            StopReason::Guest
        };
        inner.instance = None;
        inner.stop_deferred = false;
        inner.set_state(VmState::Stopped);
        tracing::info!(session, ?reason, "virtual machine stopped");
        self.events.publish(VmEvent::Stopped { reason });
    }

    pub(crate) fn on_stopped_with_error(&self, session: u64, error: RuntimeError) {
        let waiter = {
            let mut inner = self.lock();
            if inner.session != session {
                tracing::warn!(session, current = inner.session, "ignoring stale error event");
                return;
            }
            if !inner.state.is_active() {
                tracing::debug!(session, state = %inner.state, %error, "ignoring error event");
                return;
            }

            tracing::error!(session, %error, "virtual machine stopped with error");
            let waiter = inner.start_waiter.take();
            inner.fail(error.clone());
            self.events.publish(VmEvent::Failed {
                diagnostic: error.to_string(),
            });
            waiter
        };

        if let Some(waiter) = waiter {
            let _ = waiter.send(Err(error));
        }
    }
}

// ============================================================================
// Lifecycle Controller
// ============================================================================

/// Start attempt in flight.
struct PendingStart {
    session: u64,
    receiver: oneshot::Receiver<std::result::Result<(), RuntimeError>>,
}

/// Drives one virtual machine through its lifecycle.
pub struct LifecycleController {
    runtime: Arc<dyn VmRuntime>,
    registry: Arc<IdentityRegistry>,
    /// Holder of this controller's chip ID lease.
    owner: LeaseOwner,
    shared: Arc<Shared>,
}

impl LifecycleController {
    /// Creates a controller using the process-wide identity registry.
    pub fn new(runtime: impl VmRuntime + 'static) -> Self {
        Self::with_registry(runtime, IdentityRegistry::global())
    }

    /// Creates a controller using `registry` to guard chip ID reuse.
    pub fn with_registry(runtime: impl VmRuntime + 'static, registry: Arc<IdentityRegistry>) -> Self {
        Self {
            runtime: Arc::new(runtime),
            registry,
            owner: LeaseOwner::next(),
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: VmState::Unconfigured,
                    record: None,
                    session: 0,
                    instance: None,
                    start_waiter: None,
                    stop_deferred: false,
                    last_error: None,
                }),
                events: EventSink::new(),
            }),
        }
    }

    /// Current state.
    pub fn state(&self) -> VmState {
        self.shared.lock().state
    }

    /// Diagnostic of the last start or runtime failure.
    pub fn last_error(&self) -> Option<RuntimeError> {
        self.shared.lock().last_error.clone()
    }

    /// Current validated configuration.
    pub fn record(&self) -> Option<Arc<ConfigurationRecord>> {
        self.shared.lock().record.clone()
    }

    /// Event sink relaying runtime events.
    pub fn events(&self) -> &EventSink {
        &self.shared.events
    }

    /// Subscribes to runtime events.
    pub fn subscribe(&self) -> broadcast::Receiver<VmEvent> {
        self.shared.events.subscribe()
    }

    /// Validates `params` and stores the resulting record.
    ///
    /// Accepted from any inactive state. On failure the controller keeps
    /// whatever state and record it had before the call.
    pub fn configure(&self, params: VmParameters) -> Result<Arc<ConfigurationRecord>> {
        let mut inner = self.shared.lock();
        if inner.state.is_active() {
            tracing::warn!(state = %inner.state, "configure rejected, instance active");
            return Err(VmError::AlreadyActive { state: inner.state });
        }

        let record = ConfigurationRecord::new(params)
            .and_then(|record| self.admit(&record).map(|()| record))
            .inspect_err(|e| tracing::warn!(error = %e, "configuration rejected"))?;

        let record = Arc::new(record);
        inner.record = Some(Arc::clone(&record));
        inner.start_waiter = None;
        inner.last_error = None;
        inner.set_state(VmState::Configured);

        let identity = record.identity();
        tracing::info!(
            platform = %record.platform_version(),
            board_id = format_args!("{:#x}", identity.board_id()),
            chip_id = format_args!("{:#018x}", identity.chip_id()),
            cpus = record.cpu_count(),
            memory_mb = record.memory_size() / (1024 * 1024),
            debug_port = ?record.debug_port(),
            "virtual machine configured"
        );
        Ok(record)
    }

    /// Environment checks that need more than the parameters themselves.
    ///
    /// Takes the chip ID lease for the new record, replacing the one held
    /// for the previous record.
    fn admit(&self, record: &ConfigurationRecord) -> Result<()> {
        if let Some(port) = record.debug_port() {
            ensure_port_available(port)?;
        }
        match record.persistent_state_path() {
            Some(path) => self.registry.bind(self.owner, record.identity().chip_id(), path)?,
            None => self.registry.release(self.owner),
        }
        Ok(())
    }

    /// Starts the configured virtual machine.
    ///
    /// Completes once the runtime reports the outcome of its start sequence.
    /// No timeout is applied. A successful return does not mean the machine
    /// is still running; check [`state`](Self::state) or the event stream.
    pub async fn start(&self) -> Result<()> {
        let pending = self.submit()?;
        let outcome = pending.receiver.await;
        Self::finish_start(pending.session, outcome)
    }

    /// Blocking variant of [`start`](Self::start).
    ///
    /// # Panics
    ///
    /// Panics when called from within an asynchronous execution context.
    pub fn start_blocking(&self) -> Result<()> {
        let pending = self.submit()?;
        let outcome = pending.receiver.blocking_recv();
        Self::finish_start(pending.session, outcome)
    }

    fn submit(&self) -> Result<PendingStart> {
        let (submission, delegate, receiver) = {
            let mut inner = self.shared.lock();
            let record = match (inner.state, &inner.record) {
                (VmState::Configured, Some(record)) => Arc::clone(record),
                (state, _) if state.is_active() => {
                    tracing::warn!(%state, "start rejected, instance active");
                    return Err(VmError::AlreadyActive { state });
                }
                (state, _) => return Err(VmError::NotConfigured { state }),
            };

            let boot = BootDescriptor::assemble(&record);
            let start_options = StartOptions::for_record(&record);
            let (tx, rx) = oneshot::channel();

            inner.session += 1;
            inner.start_waiter = Some(tx);
            inner.stop_deferred = false;
            inner.last_error = None;
            inner.set_state(VmState::Starting);

            let submission = RuntimeSubmission {
                production_mode: record.production_mode(),
                record,
                boot,
                start_options,
            };
            (submission, RuntimeDelegate::new(&self.shared, inner.session), rx)
        };

        let session = delegate.session();
        tracing::info!(
            session,
            boot_mode = ?submission.start_options.boot_mode,
            production_mode = submission.production_mode,
            "submitting virtual machine to runtime"
        );

        match self.runtime.submit(submission, delegate) {
            Ok(handle) => self.shared.attach_instance(session, Arc::from(handle)),
            Err(error) => self.shared.on_start_completed(session, Err(error)),
        }

        Ok(PendingStart { session, receiver })
    }

    fn finish_start(
        session: u64,
        outcome: std::result::Result<std::result::Result<(), RuntimeError>, oneshot::error::RecvError>,
    ) -> Result<()> {
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(VmError::StartFailed(error.to_string())),
            Err(_) => {
                tracing::warn!(session, "start abandoned before the runtime reported back");
                Err(VmError::StartFailed(
                    "start abandoned before the runtime reported back".into(),
                ))
            }
        }
    }

    /// Asks the runtime to stop the machine and returns immediately.
    ///
    /// Valid while starting or running. During the start sequence the stop is
    /// remembered and issued once the runtime reports a successful start.
    /// Termination is confirmed later by a [`VmEvent::Stopped`]. In any
    /// other state this does nothing.
    pub fn stop_by_user_request(&self) {
        let handle = {
            let mut inner = self.shared.lock();
            match inner.state {
                VmState::Running => {
                    inner.set_state(VmState::Stopping);
                    match &inner.instance {
                        Some(instance) => Some(Arc::clone(&instance.handle)),
                        None => {
                            inner.stop_deferred = true;
                            None
                        }
                    }
                }
                VmState::Starting => {
                    tracing::info!(session = inner.session, "stop deferred until start completes");
                    inner.set_state(VmState::Stopping);
                    inner.stop_deferred = true;
                    None
                }
                state => {
                    tracing::debug!(%state, "stop request ignored");
                    None
                }
            }
        };

        if let Some(handle) = handle {
            tracing::info!("requesting virtual machine stop");
            handle.request_stop();
        }
    }
}

impl fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.lock();
        f.debug_struct("LifecycleController")
            .field("state", &inner.state)
            .field("session", &inner.session)
            .field("last_error", &inner.last_error)
            .finish_non_exhaustive()
    }
}

impl Drop for LifecycleController {
    fn drop(&mut self) {
        if self.state() == VmState::Running {
            self.stop_by_user_request();
        }
        self.registry.release(self.owner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Runtime that completes every start synchronously inside `submit`.
    #[derive(Default)]
    struct InstantRuntime {
        submissions: AtomicUsize,
        stops: Arc<AtomicUsize>,
        fail_with: Option<RuntimeError>,
    }

    struct CountingHandle(Arc<AtomicUsize>);

    impl RuntimeHandle for CountingHandle {
        fn request_stop(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl VmRuntime for InstantRuntime {
        fn submit(
            &self,
            _submission: RuntimeSubmission,
            delegate: RuntimeDelegate,
        ) -> std::result::Result<Box<dyn RuntimeHandle>, RuntimeError> {
            self.submissions.fetch_add(1, Ordering::SeqCst);
            match &self.fail_with {
                Some(error) => delegate.complete_start(Err(error.clone())),
                None => delegate.complete_start(Ok(())),
            }
            Ok(Box::new(CountingHandle(Arc::clone(&self.stops))))
        }
    }

    fn controller(runtime: Arc<InstantRuntime>) -> LifecycleController {
        LifecycleController::with_registry(runtime, Arc::new(IdentityRegistry::new()))
    }

    #[test]
    fn test_state_display() {
        assert_eq!(VmState::Unconfigured.to_string(), "unconfigured");
        assert!(VmState::Stopping.is_active());
        assert!(VmState::Failed.is_terminal());
        assert!(!VmState::Configured.is_active());
    }

    #[test]
    fn test_start_blocking_runs_to_running() {
        let runtime = Arc::new(InstantRuntime::default());
        let controller = controller(Arc::clone(&runtime));

        controller.configure(VmParameters::default()).unwrap();
        controller.start_blocking().unwrap();

        assert_eq!(controller.state(), VmState::Running);
        assert_eq!(runtime.submissions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_start_without_configuration() {
        let runtime = Arc::new(InstantRuntime::default());
        let controller = controller(Arc::clone(&runtime));

        let err = controller.start_blocking().unwrap_err();
        assert!(matches!(
            err,
            VmError::NotConfigured {
                state: VmState::Unconfigured
            }
        ));
        assert_eq!(runtime.submissions.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_start_failure_reported() {
        let runtime = Arc::new(InstantRuntime {
            fail_with: Some(RuntimeError::new(1, "invalid hardware model")),
            ..Default::default()
        });
        let controller = controller(runtime);

        controller.configure(VmParameters::default()).unwrap();
        let err = controller.start_blocking().unwrap_err();

        assert!(err.is_start_failed());
        assert!(err.to_string().contains("invalid hardware model"));
        assert_eq!(controller.state(), VmState::Failed);
        assert_eq!(controller.last_error().unwrap().code, 1);
    }

    #[test]
    fn test_failed_configure_keeps_previous_record() {
        let runtime = Arc::new(InstantRuntime::default());
        let controller = controller(runtime);

        let first = controller.configure(VmParameters::default()).unwrap();
        let err = controller
            .configure(VmParameters {
                cpu_count: 0,
                ..Default::default()
            })
            .unwrap_err();

        assert_eq!(err.field(), Some("cpu_count"));
        assert_eq!(controller.state(), VmState::Configured);
        assert_eq!(controller.record().unwrap(), first);
    }

    #[test]
    fn test_drop_stops_running_instance() {
        let runtime = Arc::new(InstantRuntime::default());
        let controller = controller(Arc::clone(&runtime));

        controller.configure(VmParameters::default()).unwrap();
        controller.start_blocking().unwrap();
        drop(controller);

        assert_eq!(runtime.stops.load(Ordering::SeqCst), 1);
    }
}
