//! Child process handle used by the supervisor

use std::future::Future;
use std::process::Stdio;

use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::launch::LaunchSpec;
use crate::supervisor::SupervisorError;

/// What the supervisor needs from a child to drive its shutdown sequence.
pub trait SupervisedChild {
    fn name(&self) -> &str;

    /// Resolves once the child has exited, with its exit code if it had one.
    fn wait(&mut self) -> impl Future<Output = Result<Option<i32>, SupervisorError>>;

    /// Graceful stop request (SIGTERM on Unix).
    fn terminate(&mut self) -> Result<(), SupervisorError>;

    fn force_kill(&mut self) -> Result<(), SupervisorError>;

    fn has_exited(&mut self) -> bool;
}

/// OS process spawned from a [`LaunchSpec`], sharing the supervisor's stdio.
#[derive(Debug)]
pub struct ManagedChild {
    name: String,
    child: Child,
    pid: Option<u32>,
}

impl ManagedChild {
    pub fn spawn(spec: &LaunchSpec) -> Result<Self, SupervisorError> {
        debug!(
            name = spec.name,
            program = %spec.program.display(),
            args = ?spec.args,
            "spawning child"
        );

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(&spec.working_dir)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            name: spec.name.to_string(),
            program: spec.program.display().to_string(),
            source,
        })?;
        let pid = child.id();

        info!(name = spec.name, pid = ?pid, "child started");

        Ok(Self {
            name: spec.name.to_string(),
            child,
            pid,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn signal_error(&self, message: impl ToString) -> SupervisorError {
        SupervisorError::Signal {
            name: self.name.clone(),
            message: message.to_string(),
        }
    }
}

impl SupervisedChild for ManagedChild {
    fn name(&self) -> &str {
        &self.name
    }

    async fn wait(&mut self) -> Result<Option<i32>, SupervisorError> {
        let status = self.child.wait().await.map_err(|source| SupervisorError::Wait {
            name: self.name.clone(),
            source,
        })?;
        debug!(name = %self.name, %status, "child exited");
        Ok(status.code())
    }

    fn terminate(&mut self) -> Result<(), SupervisorError> {
        if self.has_exited() {
            debug!(name = %self.name, "child already exited, nothing to terminate");
            return Ok(());
        }
        send_terminate(self)
    }

    fn force_kill(&mut self) -> Result<(), SupervisorError> {
        warn!(name = %self.name, pid = ?self.pid, "force killing child");
        self.child.start_kill().map_err(|e| self.signal_error(e))
    }

    fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut ManagedChild) -> Result<(), SupervisorError> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.pid else {
        return Ok(());
    };
    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => {
            debug!(name = %child.name, pid, "sent SIGTERM");
            Ok(())
        }
        Err(e) => Err(child.signal_error(e)),
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut ManagedChild) -> Result<(), SupervisorError> {
    child.child.start_kill().map_err(|e| child.signal_error(e))
}
