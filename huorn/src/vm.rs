//! Live VM handle: guarded lifecycle transitions against the engine.

use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::watch;

use crate::bundle::BundleLayout;
use crate::config::VmConfig;
use crate::engine::{Engine, Machine, OpenRequest};
use crate::error::{Error, Result};
use crate::state::{Operation, VmState};
#[cfg(unix)]
use crate::transport::console::SerialConsole;

/// A VM bound to its bundle.
///
/// Obtained from [`VmBuilder::build`](crate::VmBuilder::build) or
/// [`Huorn::load`](crate::Huorn::load). Every transition is checked against
/// the current [`VmState`] before the engine is asked to do anything, and
/// the resulting state is published to observers of
/// [`subscribe`](Self::subscribe).
pub struct VmHandle {
    /// Bundle directory.
    bundle: PathBuf,
    /// Configuration persisted in the bundle.
    config: VmConfig,
    /// Engine that owns the machine.
    engine: Arc<dyn Engine>,
    /// Engine machine; opened on first start when not provisioned here.
    machine: Option<Box<dyn Machine>>,
    /// Serial console wired up when the machine was opened.
    #[cfg(unix)]
    console: Option<SerialConsole>,
    /// Current state, observable.
    state: watch::Sender<VmState>,
}

impl fmt::Debug for VmHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmHandle")
            .field("bundle", &self.bundle)
            .field("name", &self.config.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl VmHandle {
    /// Binds a handle in state [`VmState::Created`].
    pub(crate) fn new(
        bundle: PathBuf,
        config: VmConfig,
        engine: Arc<dyn Engine>,
        machine: Option<Box<dyn Machine>>,
    ) -> Self {
        let (state, _) = watch::channel(VmState::Created);
        Self {
            bundle,
            config,
            engine,
            machine,
            #[cfg(unix)]
            console: None,
            state,
        }
    }

    /// Bundle directory.
    pub fn bundle(&self) -> &Path {
        &self.bundle
    }

    /// Configuration persisted in the bundle.
    pub const fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Current state.
    pub fn state(&self) -> VmState {
        *self.state.borrow()
    }

    /// Observes state changes.
    pub fn subscribe(&self) -> watch::Receiver<VmState> {
        self.state.subscribe()
    }

    /// Serial console, once the machine has been opened with one.
    #[cfg(unix)]
    pub const fn console(&self) -> Option<&SerialConsole> {
        self.console.as_ref()
    }

    /// Guest address as reported by the engine.
    pub async fn ip_address(&self) -> Option<IpAddr> {
        self.machine.as_ref()?.current_ip_address().await
    }

    /// Boots the guest. Valid from created or stopped.
    pub async fn start(&mut self) -> Result<()> {
        self.transition(Operation::Start).await
    }

    /// Suspends the guest. Valid from running.
    pub async fn pause(&mut self) -> Result<()> {
        self.transition(Operation::Pause).await
    }

    /// Continues the guest. Valid from paused.
    pub async fn resume(&mut self) -> Result<()> {
        self.transition(Operation::Resume).await
    }

    /// Shuts the guest down. Valid from running or paused.
    pub async fn stop(&mut self) -> Result<()> {
        self.transition(Operation::Stop).await
    }

    /// Checks `op` against the current state, runs it on the engine, and
    /// publishes each state the VM passes through.
    async fn transition(&mut self, op: Operation) -> Result<()> {
        let (transitional, settled) = op.plan(self.state())?;
        if let Some(state) = transitional {
            self.state.send_replace(state);
        }

        match self.run(op).await {
            Ok(()) => {
                self.state.send_replace(settled);
                tracing::info!(vm = %self.config.name, state = %settled, "{op} complete");
                Ok(())
            }
            Err(e) => {
                self.state.send_replace(VmState::Error);
                tracing::warn!(vm = %self.config.name, error = %e, "{op} failed");
                Err(match e {
                    Error::Provisioning(_) => e,
                    other => Error::Provisioning(other.to_string()),
                })
            }
        }
    }

    /// Delegates `op` to the machine, opening it first if needed.
    async fn run(&mut self, op: Operation) -> Result<()> {
        if self.machine.is_none() {
            self.open_machine().await?;
        }
        let machine = self
            .machine
            .as_mut()
            .ok_or_else(|| Error::Provisioning("engine returned no machine".into()))?;

        match op {
            Operation::Start => machine.start().await,
            Operation::Pause => machine.pause().await,
            Operation::Resume => machine.resume().await,
            Operation::Stop => machine.stop().await,
        }
    }

    /// Asks the engine for a machine over the bundle, handing it the guest
    /// ends of a fresh serial console.
    async fn open_machine(&mut self) -> Result<()> {
        let layout = BundleLayout::new(&self.bundle);

        #[cfg(unix)]
        let mut console = SerialConsole::new()?;
        let request = OpenRequest {
            config: &self.config,
            layout: &layout,
            #[cfg(unix)]
            console: console.take_endpoints(),
        };
        let machine = self.engine.open(request).await?;

        self.machine = Some(machine);
        #[cfg(unix)]
        {
            self.console = Some(console);
        }
        tracing::debug!(vm = %self.config.name, "machine opened");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::engine::{ImageRequirements, ProvisionRequest};

    /// Records calls and fails `stop` on request.
    #[derive(Default)]
    struct Recorder {
        calls: Arc<Mutex<Vec<&'static str>>>,
        fail_stop: bool,
    }

    #[async_trait]
    impl Machine for Recorder {
        async fn start(&mut self) -> Result<()> {
            self.calls.lock().unwrap().push("start");
            Ok(())
        }

        async fn stop(&mut self) -> Result<()> {
            self.calls.lock().unwrap().push("stop");
            if self.fail_stop {
                return Err(Error::Io(std::io::Error::other("guest hung")));
            }
            Ok(())
        }

        async fn pause(&mut self) -> Result<()> {
            self.calls.lock().unwrap().push("pause");
            Ok(())
        }

        async fn resume(&mut self) -> Result<()> {
            self.calls.lock().unwrap().push("resume");
            Ok(())
        }

        async fn current_ip_address(&self) -> Option<IpAddr> {
            Some(IpAddr::from([192, 168, 64, 2]))
        }
    }

    /// Engine whose `open` hands out a [`Recorder`].
    #[derive(Default)]
    struct OpenOnly {
        calls: Arc<Mutex<Vec<&'static str>>>,
        got_console: AtomicBool,
    }

    #[async_trait]
    impl Engine for OpenOnly {
        fn is_supported(&self) -> bool {
            true
        }

        async fn image_requirements(&self, _: &Path) -> Result<ImageRequirements> {
            unreachable!("not used by the handle")
        }

        async fn provision(&self, _: ProvisionRequest<'_>) -> Result<Box<dyn Machine>> {
            unreachable!("not used by the handle")
        }

        async fn open(&self, request: OpenRequest<'_>) -> Result<Box<dyn Machine>> {
            #[cfg(unix)]
            self.got_console
                .store(request.console.is_some(), Ordering::SeqCst);
            let _ = request;
            self.calls.lock().unwrap().push("open");
            Ok(Box::new(Recorder {
                calls: Arc::clone(&self.calls),
                fail_stop: false,
            }))
        }
    }

    fn handle_with(engine: Arc<dyn Engine>, machine: Option<Box<dyn Machine>>) -> VmHandle {
        VmHandle::new(PathBuf::from("/nowhere/vm.huornvm"), VmConfig::named("vm"), engine, machine)
    }

    #[tokio::test]
    async fn full_lifecycle_publishes_states() {
        let engine = Arc::new(OpenOnly::default());
        let calls = Arc::clone(&engine.calls);
        let shared: Arc<OpenOnly> = Arc::clone(&engine);
        let mut vm = handle_with(shared, None);
        let mut rx = vm.subscribe();
        assert_eq!(vm.state(), VmState::Created);
        assert_eq!(vm.ip_address().await, None);

        vm.start().await.unwrap();
        assert_eq!(vm.state(), VmState::Running);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), VmState::Running);

        vm.pause().await.unwrap();
        assert_eq!(vm.state(), VmState::Paused);
        vm.resume().await.unwrap();
        assert_eq!(vm.state(), VmState::Running);
        vm.stop().await.unwrap();
        assert_eq!(vm.state(), VmState::Stopped);
        vm.start().await.unwrap();

        assert_eq!(
            *calls.lock().unwrap(),
            ["open", "start", "pause", "resume", "stop", "start"]
        );
        assert_eq!(vm.ip_address().await, Some(IpAddr::from([192, 168, 64, 2])));
        #[cfg(unix)]
        {
            assert!(engine.got_console.load(Ordering::SeqCst));
            assert!(vm.console().is_some());
        }
    }

    #[tokio::test]
    async fn illegal_transitions_name_state_and_operation() {
        let mut vm = handle_with(Arc::new(OpenOnly::default()), None);

        let err = vm.stop().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Lifecycle {
                state: VmState::Created,
                operation: Operation::Stop
            }
        ));
        assert_eq!(err.to_string(), "cannot stop a vm that is created");
        assert!(vm.pause().await.is_err());
        assert!(vm.resume().await.is_err());
        assert_eq!(vm.state(), VmState::Created);
    }

    #[tokio::test]
    async fn engine_failure_moves_to_error() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let machine = Recorder {
            calls: Arc::clone(&calls),
            fail_stop: true,
        };
        let mut vm = handle_with(Arc::new(OpenOnly::default()), Some(Box::new(machine)));

        vm.start().await.unwrap();
        let err = vm.stop().await.unwrap_err();
        assert!(matches!(err, Error::Provisioning(ref msg) if msg.contains("guest hung")));
        assert_eq!(vm.state(), VmState::Error);
        assert!(vm.start().await.is_err());
        // Provisioned machine was used directly.
        assert_eq!(*calls.lock().unwrap(), ["start", "stop"]);
    }
}
