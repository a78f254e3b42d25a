#![allow(dead_code)]

use std::net::{Ipv4Addr, TcpListener};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use avpvm_core::{
    IdentityRegistry, LifecycleController, RuntimeDelegate, RuntimeError, RuntimeHandle,
    RuntimeSubmission, VmParameters, VmRuntime,
};

/// How the scripted runtime answers a submission.
#[derive(Debug, Clone)]
pub enum Script {
    /// Report a successful start before `submit` returns.
    Succeed,
    /// Report a failed start before `submit` returns.
    Fail(RuntimeError),
    /// Accept the submission and leave completion to the test.
    Hold,
    /// Refuse the submission outright.
    Reject(RuntimeError),
}

/// In-process runtime whose behavior is driven by the test.
pub struct ScriptedRuntime {
    script: Mutex<Script>,
    /// Whether a stop request is confirmed with a guest stop event.
    confirm_stops: bool,
    submissions: AtomicUsize,
    stop_requests: Arc<AtomicUsize>,
    last: Mutex<Option<(RuntimeSubmission, RuntimeDelegate)>>,
}

impl ScriptedRuntime {
    pub fn new(script: Script) -> Arc<Self> {
        Self::build(script, true)
    }

    /// A runtime that records stop requests but never confirms them.
    pub fn unresponsive(script: Script) -> Arc<Self> {
        Self::build(script, false)
    }

    fn build(script: Script, confirm_stops: bool) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            confirm_stops,
            submissions: AtomicUsize::new(0),
            stop_requests: Arc::new(AtomicUsize::new(0)),
            last: Mutex::new(None),
        })
    }

    pub fn set_script(&self, script: Script) {
        *self.script.lock().unwrap() = script;
    }

    pub fn submissions(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    pub fn stop_requests(&self) -> usize {
        self.stop_requests.load(Ordering::SeqCst)
    }

    /// Delegate handed over with the most recent submission.
    pub fn delegate(&self) -> RuntimeDelegate {
        self.last.lock().unwrap().as_ref().unwrap().1.clone()
    }

    /// Most recent submission.
    pub fn submission(&self) -> RuntimeSubmission {
        self.last.lock().unwrap().as_ref().unwrap().0.clone()
    }

    /// Waits until `count` submissions have been seen.
    pub async fn wait_for_submissions(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.submissions() < count {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("submission not seen in time");
    }
}

impl VmRuntime for ScriptedRuntime {
    fn submit(
        &self,
        submission: RuntimeSubmission,
        delegate: RuntimeDelegate,
    ) -> Result<Box<dyn RuntimeHandle>, RuntimeError> {
        let script = self.script.lock().unwrap().clone();
        if let Script::Reject(error) = script {
            return Err(error);
        }

        self.submissions.fetch_add(1, Ordering::SeqCst);
        *self.last.lock().unwrap() = Some((submission, delegate.clone()));

        match script {
            Script::Succeed => delegate.complete_start(Ok(())),
            Script::Fail(error) => delegate.complete_start(Err(error)),
            Script::Hold | Script::Reject(_) => {}
        }

        Ok(Box::new(ScriptedHandle {
            delegate,
            confirm: self.confirm_stops,
            stop_requests: Arc::clone(&self.stop_requests),
        }))
    }
}

struct ScriptedHandle {
    delegate: RuntimeDelegate,
    confirm: bool,
    stop_requests: Arc<AtomicUsize>,
}

impl RuntimeHandle for ScriptedHandle {
    fn request_stop(&self) {
        self.stop_requests.fetch_add(1, Ordering::SeqCst);
        if self.confirm {
            self.delegate.guest_did_stop();
        }
    }
}

/// Controller with a private identity registry.
pub fn controller(runtime: &Arc<ScriptedRuntime>) -> LifecycleController {
    LifecycleController::with_registry(Arc::clone(runtime), Arc::new(IdentityRegistry::new()))
}

/// Parameters for an instance with persisted state at `aux`.
pub fn persistent(aux: &str, chip_id: u64) -> VmParameters {
    VmParameters {
        aux_path: Some(PathBuf::from(aux)),
        chip_id: Some(chip_id),
        ..Default::default()
    }
}

/// A loopback port that was free a moment ago.
pub fn free_port() -> u16 {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    listener.local_addr().unwrap().port()
}
