//! Joint lifecycle of the dev children: the first exit or stop signal
//! brings every child down, exactly once.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use futures::future::{join_all, select_all};
use thiserror::Error;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::child::SupervisedChild;

pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to spawn {name} process ({program}): {source}")]
    Spawn {
        name: String,
        program: String,
        source: io::Error,
    },

    #[error("Failed to wait on {name} process: {source}")]
    Wait { name: String, source: io::Error },

    #[error("Failed to signal {name} process: {message}")]
    Signal { name: String, message: String },

    #[error("Failed to install signal handlers: {0}")]
    SignalHandler(#[source] io::Error),

    #[error("No child processes to supervise")]
    NoChildren,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Interrupt,
    Terminate,
}

impl StopSignal {
    pub fn name(&self) -> &'static str {
        match self {
            StopSignal::Interrupt => "SIGINT",
            StopSignal::Terminate => "SIGTERM",
        }
    }

    /// Shell convention: 128 + signal number.
    pub fn exit_code(&self) -> i32 {
        match self {
            StopSignal::Interrupt => 130,
            StopSignal::Terminate => 143,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownTrigger {
    Signal(StopSignal),
    ChildExited { name: String, code: Option<i32> },
}

impl ShutdownTrigger {
    pub fn exit_code(&self) -> i32 {
        match self {
            ShutdownTrigger::Signal(signal) => signal.exit_code(),
            ShutdownTrigger::ChildExited { code, .. } => code.unwrap_or(1),
        }
    }
}

impl fmt::Display for ShutdownTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownTrigger::Signal(signal) => write!(f, "received {}", signal.name()),
            ShutdownTrigger::ChildExited { name, code: Some(code) } => {
                write!(f, "{name} exited with code {code}")
            }
            ShutdownTrigger::ChildExited { name, code: None } => {
                write!(f, "{name} was terminated by a signal")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ShutdownState {
    Running = 0,
    ShuttingDown = 1,
    Terminated = 2,
}

/// Lets exactly one trigger move the supervisor out of `Running`.
#[derive(Debug)]
pub struct ShutdownGuard {
    state: AtomicU8,
}

impl ShutdownGuard {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ShutdownState::Running as u8),
        }
    }

    pub fn state(&self) -> ShutdownState {
        match self.state.load(Ordering::Acquire) {
            0 => ShutdownState::Running,
            1 => ShutdownState::ShuttingDown,
            _ => ShutdownState::Terminated,
        }
    }

    /// Returns `true` only for the call that starts the shutdown.
    pub fn begin(&self) -> bool {
        self.state
            .compare_exchange(
                ShutdownState::Running as u8,
                ShutdownState::ShuttingDown as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn finish(&self) {
        self.state
            .store(ShutdownState::Terminated as u8, Ordering::Release);
    }
}

impl Default for ShutdownGuard {
    fn default() -> Self {
        Self::new()
    }
}

enum Wake {
    Signal(StopSignal),
    Exit(usize, Result<Option<i32>, SupervisorError>),
}

pub struct Supervisor<C> {
    children: Vec<C>,
    guard: ShutdownGuard,
    grace: Duration,
}

impl<C: SupervisedChild> Supervisor<C> {
    pub fn new(children: Vec<C>, grace: Duration) -> Self {
        Self {
            children,
            guard: ShutdownGuard::new(),
            grace,
        }
    }

    pub fn state(&self) -> ShutdownState {
        self.guard.state()
    }

    /// Waits for the first child exit or stop signal, shuts everything down
    /// and returns the exit code the supervisor should leave with.
    pub async fn run(
        &mut self,
        mut signals: UnboundedReceiver<StopSignal>,
    ) -> Result<i32, SupervisorError> {
        if self.children.is_empty() {
            return Err(SupervisorError::NoChildren);
        }

        let wake = {
            let exits = select_all(self.children.iter_mut().map(|child| Box::pin(child.wait())));
            tokio::select! {
                Some(signal) = signals.recv() => Wake::Signal(signal),
                (result, index, _) = exits => Wake::Exit(index, result),
            }
        };

        let trigger = match wake {
            Wake::Signal(signal) => ShutdownTrigger::Signal(signal),
            Wake::Exit(index, result) => {
                let name = self.children[index].name().to_string();
                let code = result.unwrap_or_else(|e| {
                    warn!(error = %e, "lost track of child exit status");
                    None
                });
                ShutdownTrigger::ChildExited { name, code }
            }
        };

        self.shutdown(&trigger, &mut signals).await;
        Ok(trigger.exit_code())
    }

    /// Sends the graceful terminate to every child if this trigger is the first.
    pub fn begin_shutdown(&mut self, trigger: &ShutdownTrigger) -> bool {
        if !self.guard.begin() {
            debug!(%trigger, "shutdown already in progress");
            return false;
        }

        info!(%trigger, "stopping children");
        for child in self.children.iter_mut() {
            if let Err(e) = child.terminate() {
                warn!(name = child.name(), error = %e, "terminate failed");
            }
        }
        true
    }

    async fn shutdown(
        &mut self,
        trigger: &ShutdownTrigger,
        signals: &mut UnboundedReceiver<StopSignal>,
    ) {
        if !self.begin_shutdown(trigger) {
            return;
        }

        let drained = {
            let guard = &self.guard;
            let all = join_all(self.children.iter_mut().map(|child| child.wait()));
            let deadline = tokio::time::sleep(self.grace);
            tokio::pin!(all, deadline);

            loop {
                tokio::select! {
                    _ = &mut all => break true,
                    Some(signal) = signals.recv() => {
                        if !guard.begin() {
                            info!(signal = signal.name(), "shutdown already in progress");
                        }
                    }
                    _ = &mut deadline => break false,
                }
            }
        };

        if !drained {
            warn!(grace_ms = self.grace.as_millis() as u64, "children still running after grace period");
            for child in self.children.iter_mut() {
                if child.has_exited() {
                    continue;
                }
                if let Err(e) = child.force_kill() {
                    warn!(name = child.name(), error = %e, "force kill failed");
                }
            }
            join_all(self.children.iter_mut().map(|child| child.wait())).await;
        }

        self.guard.finish();
        info!("all children stopped");
    }
}

/// Kills a child outside a supervised run and waits for it, logging failures.
pub async fn reap_child<C: SupervisedChild>(child: &mut C) {
    if let Err(e) = child.force_kill() {
        warn!(name = child.name(), error = %e, "cleanup kill failed");
    }
    if let Err(e) = child.wait().await {
        warn!(name = child.name(), error = %e, "cleanup wait failed");
    }
}

/// Forwards SIGINT/SIGTERM (Ctrl-C elsewhere) into the supervisor's channel.
pub fn forward_os_signals(
    tx: UnboundedSender<StopSignal>,
) -> Result<JoinHandle<()>, SupervisorError> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut interrupt =
            signal(SignalKind::interrupt()).map_err(SupervisorError::SignalHandler)?;
        let mut terminate =
            signal(SignalKind::terminate()).map_err(SupervisorError::SignalHandler)?;

        Ok(tokio::spawn(async move {
            loop {
                let stop = tokio::select! {
                    Some(()) = interrupt.recv() => StopSignal::Interrupt,
                    Some(()) = terminate.recv() => StopSignal::Terminate,
                    else => break,
                };
                if tx.send(stop).is_err() {
                    break;
                }
            }
        }))
    }

    #[cfg(not(unix))]
    {
        Ok(tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if tx.send(StopSignal::Interrupt).is_err() {
                    break;
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use tokio::sync::{mpsc, watch};

    struct FakeChild {
        name: &'static str,
        exit_tx: watch::Sender<Option<i32>>,
        exit_rx: watch::Receiver<Option<i32>>,
        honors_terminate: bool,
        terminated: Arc<AtomicUsize>,
        killed: Arc<AtomicUsize>,
    }

    impl FakeChild {
        fn new(name: &'static str, honors_terminate: bool) -> Self {
            let (exit_tx, exit_rx) = watch::channel(None);
            Self {
                name,
                exit_tx,
                exit_rx,
                honors_terminate,
                terminated: Arc::new(AtomicUsize::new(0)),
                killed: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn exited(self, code: i32) -> Self {
            self.exit_tx.send_replace(Some(code));
            self
        }

        fn counters(&self) -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
            (self.terminated.clone(), self.killed.clone())
        }
    }

    impl SupervisedChild for FakeChild {
        fn name(&self) -> &str {
            self.name
        }

        async fn wait(&mut self) -> Result<Option<i32>, SupervisorError> {
            let code = *self
                .exit_rx
                .wait_for(Option::is_some)
                .await
                .expect("sender lives in the same struct");
            Ok(code)
        }

        fn terminate(&mut self) -> Result<(), SupervisorError> {
            self.terminated.fetch_add(1, Ordering::SeqCst);
            if self.honors_terminate && self.exit_tx.borrow().is_none() {
                self.exit_tx.send_replace(Some(143));
            }
            Ok(())
        }

        fn force_kill(&mut self) -> Result<(), SupervisorError> {
            self.killed.fetch_add(1, Ordering::SeqCst);
            self.exit_tx.send_replace(Some(137));
            Ok(())
        }

        fn has_exited(&mut self) -> bool {
            self.exit_rx.borrow().is_some()
        }
    }

    fn count(counter: &Arc<AtomicUsize>) -> usize {
        counter.load(Ordering::SeqCst)
    }

    #[test]
    fn guard_admits_a_single_shutdown() {
        let guard = ShutdownGuard::new();
        assert_eq!(guard.state(), ShutdownState::Running);
        assert!(guard.begin());
        assert!(!guard.begin());
        assert_eq!(guard.state(), ShutdownState::ShuttingDown);
        guard.finish();
        assert_eq!(guard.state(), ShutdownState::Terminated);
        assert!(!guard.begin());
    }

    #[test]
    fn trigger_exit_codes() {
        let exited = ShutdownTrigger::ChildExited {
            name: "api".to_string(),
            code: Some(3),
        };
        let killed = ShutdownTrigger::ChildExited {
            name: "web".to_string(),
            code: None,
        };
        assert_eq!(exited.exit_code(), 3);
        assert_eq!(killed.exit_code(), 1);
        assert_eq!(ShutdownTrigger::Signal(StopSignal::Interrupt).exit_code(), 130);
        assert_eq!(ShutdownTrigger::Signal(StopSignal::Terminate).exit_code(), 143);
        assert_eq!(exited.to_string(), "api exited with code 3");
    }

    #[tokio::test]
    async fn child_exit_stops_the_other_child() {
        let api = FakeChild::new("api", true).exited(3);
        let web = FakeChild::new("web", true);
        let (web_terminated, web_killed) = web.counters();
        let (_tx, rx) = mpsc::unbounded_channel();

        let mut supervisor = Supervisor::new(vec![api, web], Duration::from_secs(5));
        let code = supervisor.run(rx).await.unwrap();

        assert_eq!(code, 3);
        assert_eq!(count(&web_terminated), 1);
        assert_eq!(count(&web_killed), 0);
        assert_eq!(supervisor.state(), ShutdownState::Terminated);
    }

    #[tokio::test]
    async fn queued_signals_terminate_each_child_once() {
        let api = FakeChild::new("api", true);
        let web = FakeChild::new("web", true);
        let (api_terminated, _) = api.counters();
        let (web_terminated, _) = web.counters();
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(StopSignal::Interrupt).unwrap();
        tx.send(StopSignal::Terminate).unwrap();

        let mut supervisor = Supervisor::new(vec![api, web], Duration::from_secs(5));
        let code = supervisor.run(rx).await.unwrap();

        assert_eq!(code, 130);
        assert_eq!(count(&api_terminated), 1);
        assert_eq!(count(&web_terminated), 1);
    }

    #[tokio::test]
    async fn signal_during_child_exit_shutdown_is_ignored() {
        let api = FakeChild::new("api", true).exited(0);
        let web = FakeChild::new("web", false);
        let (api_terminated, _) = api.counters();
        let (web_terminated, web_killed) = web.counters();
        let (tx, rx) = mpsc::unbounded_channel();
        let late = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = tx.send(StopSignal::Interrupt);
        });

        let mut supervisor = Supervisor::new(vec![api, web], Duration::from_millis(100));
        let code = supervisor.run(rx).await.unwrap();
        late.await.unwrap();

        assert_eq!(code, 0);
        assert_eq!(count(&api_terminated), 1);
        assert_eq!(count(&web_terminated), 1);
        assert_eq!(count(&web_killed), 1);
    }

    #[test]
    fn repeated_triggers_do_not_resend_terminate() {
        let api = FakeChild::new("api", false);
        let web = FakeChild::new("web", false);
        let (api_terminated, _) = api.counters();
        let (web_terminated, _) = web.counters();

        let mut supervisor = Supervisor::new(vec![api, web], Duration::from_secs(5));
        assert!(supervisor.begin_shutdown(&ShutdownTrigger::Signal(StopSignal::Interrupt)));
        assert!(!supervisor.begin_shutdown(&ShutdownTrigger::ChildExited {
            name: "api".to_string(),
            code: Some(0),
        }));

        assert_eq!(count(&api_terminated), 1);
        assert_eq!(count(&web_terminated), 1);
    }

    #[tokio::test]
    async fn signal_shutdown_exits_with_signal_code() {
        let api = FakeChild::new("api", true);
        let web = FakeChild::new("web", true);
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(StopSignal::Terminate).unwrap();

        let mut supervisor = Supervisor::new(vec![api, web], Duration::from_secs(5));
        assert_eq!(supervisor.run(rx).await.unwrap(), 143);
    }

    #[tokio::test]
    async fn stubborn_child_is_force_killed_after_grace() {
        let api = FakeChild::new("api", true);
        let web = FakeChild::new("web", false);
        let (_, api_killed) = api.counters();
        let (web_terminated, web_killed) = web.counters();
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(StopSignal::Interrupt).unwrap();

        let mut supervisor = Supervisor::new(vec![api, web], Duration::from_millis(50));
        let code = supervisor.run(rx).await.unwrap();

        assert_eq!(code, 130);
        assert_eq!(count(&web_terminated), 1);
        assert_eq!(count(&web_killed), 1);
        assert_eq!(count(&api_killed), 0);
    }

    #[tokio::test]
    async fn reaping_kills_and_waits_for_the_child() {
        let mut api = FakeChild::new("api", false);
        let (api_terminated, api_killed) = api.counters();

        reap_child(&mut api).await;

        assert!(api.has_exited());
        assert_eq!(count(&api_killed), 1);
        assert_eq!(count(&api_terminated), 0);
    }

    #[tokio::test]
    async fn empty_supervisor_is_an_error() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let mut supervisor: Supervisor<FakeChild> = Supervisor::new(Vec::new(), DEFAULT_GRACE);
        assert!(matches!(
            supervisor.run(rx).await,
            Err(SupervisorError::NoChildren)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn real_children_follow_the_first_exit() {
        use crate::child::ManagedChild;
        use crate::launch::LaunchSpec;
        use std::path::PathBuf;

        let shell = |name: &'static str, script: &str| LaunchSpec {
            name,
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), script.to_string()],
            env: Vec::new(),
            working_dir: std::env::temp_dir(),
        };

        let api = ManagedChild::spawn(&shell("api", "sleep 0.2; exit 4")).unwrap();
        let web = ManagedChild::spawn(&shell("web", "sleep 30")).unwrap();
        let (_tx, rx) = mpsc::unbounded_channel();

        let mut supervisor = Supervisor::new(vec![api, web], Duration::from_secs(5));
        assert_eq!(supervisor.run(rx).await.unwrap(), 4);
    }
}
