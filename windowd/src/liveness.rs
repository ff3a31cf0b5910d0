//! Waiting for another process to exit
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use thiserror::Error;
use tracing::trace;
use windowd_api::ProcessId;

/// Local signal to stop waiting
///
/// Once raised, stays raised. Clones share the signal.
#[derive(Clone, Debug)]
pub struct Interrupt {
    tx: Arc<Mutex<Option<flume::Sender<()>>>>,
    rx: flume::Receiver<()>,
}

impl Default for Interrupt {
    fn default() -> Self {
        let (tx, rx) = flume::bounded(1);
        Self {
            tx: Arc::new(Mutex::new(Some(tx))),
            rx,
        }
    }
}

impl Interrupt {
    pub fn raise(&self) {
        // dropping the only sender wakes every receiver
        self.tx.lock().expect("Locking failed").take();
    }

    pub fn is_raised(&self) -> bool {
        matches!(self.rx.try_recv(), Err(flume::TryRecvError::Disconnected))
    }

    /// Block up to `timeout`; returns `true` if the interrupt was raised
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        matches!(
            self.rx.recv_timeout(timeout),
            Err(flume::RecvTimeoutError::Disconnected)
        )
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    ProcessExited,
    Interrupted,
}

#[derive(Error, Debug)]
pub enum WaitError {
    #[error("can not obtain a handle on process {pid}")]
    CannotOpen { pid: ProcessId },
    #[error("waiting on process {pid} failed")]
    Wait {
        pid: ProcessId,
        #[source]
        source: nix::Error,
    },
}

/// Block until process `pid` exits or `interrupt` is raised, whichever first
pub trait ProcessWaiter: Send + Sync + 'static {
    fn wait_exit_or_interrupt(
        &self,
        pid: ProcessId,
        interrupt: &Interrupt,
    ) -> Result<WaitOutcome, WaitError>;
}

/// Probes the process with signal 0 every `poll_period`
///
/// A zombie still counts as alive, until its parent reaps it.
#[derive(Debug, Clone)]
pub struct PidWaiter {
    poll_period: Duration,
}

impl PidWaiter {
    pub fn new(poll_period: Duration) -> Self {
        Self { poll_period }
    }
}

impl ProcessWaiter for PidWaiter {
    fn wait_exit_or_interrupt(
        &self,
        pid: ProcessId,
        interrupt: &Interrupt,
    ) -> Result<WaitOutcome, WaitError> {
        let raw_pid = i32::try_from(pid.0)
            .ok()
            .filter(|raw| 0 < *raw)
            .ok_or(WaitError::CannotOpen { pid })?;
        let nix_pid = Pid::from_raw(raw_pid);

        loop {
            if interrupt.is_raised() {
                return Ok(WaitOutcome::Interrupted);
            }

            match kill(nix_pid, None) {
                // EPERM: exists, just not ours to signal
                Ok(()) | Err(Errno::EPERM) => {}
                Err(Errno::ESRCH) => {
                    trace!(%pid, "Process is gone");
                    return Ok(WaitOutcome::ProcessExited);
                }
                Err(source) => return Err(WaitError::Wait { pid, source }),
            }

            if interrupt.wait_timeout(self.poll_period) {
                return Ok(WaitOutcome::Interrupted);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::AutoJoinHandle;
    use std::time::Instant;

    #[test]
    fn interrupt_wakes_a_waiter_on_a_live_process() -> anyhow::Result<()> {
        let interrupt = Interrupt::default();
        let (tx, rx) = flume::bounded(1);

        let _waiter = AutoJoinHandle::spawn("waiter", {
            let interrupt = interrupt.clone();
            move || {
                let res = PidWaiter::new(Duration::from_millis(10))
                    .wait_exit_or_interrupt(ProcessId::current(), &interrupt);
                tx.send(res.map_err(|e| e.to_string())).unwrap();
            }
        })?;

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        interrupt.raise();
        assert!(interrupt.is_raised());
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5))?,
            Ok(WaitOutcome::Interrupted)
        );
        Ok(())
    }

    #[test]
    fn exited_process_is_detected() -> anyhow::Result<()> {
        let mut child = std::process::Command::new("true").spawn()?;
        let pid = ProcessId(child.id());
        child.wait()?;

        let start = Instant::now();
        let res = PidWaiter::new(Duration::from_millis(10))
            .wait_exit_or_interrupt(pid, &Interrupt::default())?;
        assert_eq!(res, WaitOutcome::ProcessExited);
        assert!(start.elapsed() < Duration::from_secs(5));
        Ok(())
    }

    #[test]
    fn invalid_pid_can_not_be_opened() {
        let res = PidWaiter::new(Duration::from_millis(10))
            .wait_exit_or_interrupt(ProcessId(0), &Interrupt::default());
        assert!(matches!(res, Err(WaitError::CannotOpen { .. })));
    }
}
