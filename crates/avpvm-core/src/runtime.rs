//! Boundary to the hypervisor runtime.
//!
//! The runtime is an opaque engine: it accepts a configuration plus boot
//! descriptor, starts the machine on its own scheduling domain and reports
//! back through a [`RuntimeDelegate`]. Adapters implement [`VmRuntime`] and
//! translate these value types into whatever call shapes the engine needs;
//! nothing else in the crate knows about the engine.

use std::fmt;
use std::sync::{Arc, Weak};

use crate::boot::{BootDescriptor, StartOptions};
use crate::config::ConfigurationRecord;
use crate::controller::Shared;
use crate::error::RuntimeError;

/// Everything the runtime needs to bring up one instance.
#[derive(Debug, Clone)]
pub struct RuntimeSubmission {
    /// Validated configuration.
    pub record: Arc<ConfigurationRecord>,
    /// Boot descriptor assembled for this start attempt.
    pub boot: BootDescriptor,
    /// Production fuse setting, applied to the platform configuration after
    /// it has been constructed.
    pub production_mode: bool,
    /// Start options for this attempt.
    pub start_options: StartOptions,
}

/// A hypervisor runtime able to run one virtual machine per submission.
pub trait VmRuntime: Send + Sync {
    /// Hands a configuration to the runtime and begins starting it.
    ///
    /// Must not block on the start sequence itself. The outcome is reported
    /// exactly once through [`RuntimeDelegate::complete_start`], possibly
    /// before this call returns and possibly from another thread. An `Err`
    /// return means nothing was started and the delegate will not be used.
    fn submit(
        &self,
        submission: RuntimeSubmission,
        delegate: RuntimeDelegate,
    ) -> Result<Box<dyn RuntimeHandle>, RuntimeError>;
}

impl<T: VmRuntime + ?Sized> VmRuntime for Arc<T> {
    fn submit(
        &self,
        submission: RuntimeSubmission,
        delegate: RuntimeDelegate,
    ) -> Result<Box<dyn RuntimeHandle>, RuntimeError> {
        (**self).submit(submission, delegate)
    }
}

/// Control handle on a live runtime instance.
pub trait RuntimeHandle: Send + Sync {
    /// Asks the runtime to stop the instance.
    ///
    /// Returns immediately. Completion is reported later through
    /// [`RuntimeDelegate::guest_did_stop`] or
    /// [`RuntimeDelegate::did_stop_with_error`].
    fn request_stop(&self);
}

/// Callback endpoint handed to the runtime with each submission.
///
/// Cheap to clone and safe to call from any thread. Every delegate belongs to
/// one start attempt; calls made after the controller moved on to another
/// attempt, or after it was dropped, are ignored.
#[derive(Clone)]
pub struct RuntimeDelegate {
    shared: Weak<Shared>,
    session: u64,
}

impl RuntimeDelegate {
    pub(crate) fn new(shared: &Arc<Shared>, session: u64) -> Self {
        Self {
            shared: Arc::downgrade(shared),
            session,
        }
    }

    /// Start attempt this delegate belongs to.
    #[must_use]
    pub fn session(&self) -> u64 {
        self.session
    }

    /// Reports the outcome of the start sequence. Only the first call counts.
    pub fn complete_start(&self, result: Result<(), RuntimeError>) {
        match self.shared.upgrade() {
            Some(shared) => shared.on_start_completed(self.session, result),
            None => tracing::debug!(session = self.session, "start completed after controller drop"),
        }
    }

    /// Reports that the guest or the hardware halted the machine.
    pub fn guest_did_stop(&self) {
        match self.shared.upgrade() {
            Some(shared) => shared.on_guest_stopped(self.session),
            None => tracing::debug!(session = self.session, "stop reported after controller drop"),
        }
    }

    /// Reports that the machine stopped because of a runtime error.
    pub fn did_stop_with_error(&self, error: RuntimeError) {
        match self.shared.upgrade() {
            Some(shared) => shared.on_stopped_with_error(self.session, error),
            None => tracing::debug!(
                session = self.session,
                %error,
                "runtime error reported after controller drop"
            ),
        }
    }
}

impl fmt::Debug for RuntimeDelegate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeDelegate")
            .field("session", &self.session)
            .field("attached", &(self.shared.strong_count() > 0))
            .finish()
    }
}
