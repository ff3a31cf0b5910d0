//! Per-process election and commandline routing
//!
//! On construction a [`WindowManager`] registers as a leadership candidate
//! and connects to the leader, becoming it if there is none. It then decides,
//! with the leader, whether this process should own a window. Followers that
//! own a window watch the leader process on a background thread and elect a
//! new leader when it dies.
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use derive_more::Display;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn};
use windowd_api::{CommandlineArgs, ProcessId, WindowActivatedArgs};

use crate::event::{Event, EventToken};
use crate::liveness::{Interrupt, PidWaiter, ProcessWaiter, WaitError, WaitOutcome};
use crate::monarch::{FindTargetWindowArgs, LeaderHandle, Monarch};
use crate::params::Parameters;
use crate::peasant::{Peasant, WindowExecutor};
use crate::registry::{LeaderRegistry, RegistrationToken, RegistryError};
use crate::rpc::{RpcError, RpcResult, RpcServer};
use crate::task::{AutoJoinHandle, PanicGuard};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Display)]
pub enum ManagerState {
    Uninitialized,
    RegisteredCandidate,
    Leader,
    Follower,
    /// Follower watching the leader process
    Watching,
    /// Leader died, electing a new one
    ReElecting,
    ShuttingDown,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Display)]
pub enum Role {
    Leader,
    Follower,
}

impl From<Role> for ManagerState {
    fn from(role: Role) -> Self {
        match role {
            Role::Leader => ManagerState::Leader,
            Role::Follower => ManagerState::Follower,
        }
    }
}

#[derive(Error, Debug)]
pub enum WindowManagerError {
    #[error("leader registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("leader request failed: {0}")]
    Rpc(#[from] RpcError),
    #[error("waiting on the leader failed: {0}")]
    Wait(#[from] WaitError),
    #[error("leader monitor panicked")]
    MonitorPanicked,
    #[error("shutting down")]
    ShuttingDown,
}

impl WindowManagerError {
    fn is_leader_unreachable(&self) -> bool {
        matches!(self, WindowManagerError::Rpc(e) if e.is_unreachable())
    }
}

pub type WindowManagerResult<T> = std::result::Result<T, WindowManagerError>;

/// Leader we're connected to in the current election term
struct Term {
    leader: LeaderHandle,
    leader_pid: ProcessId,
    role: Role,
    /// Our forwarding of the monarch's `FindTargetWindowRequested`, if we host it
    subscription: Option<(Arc<Monarch>, EventToken)>,
}

impl Drop for Term {
    fn drop(&mut self) {
        if let Some((monarch, token)) = self.subscription.take() {
            monarch.find_target_window_requested().unsubscribe(token);
        }
    }
}

/// Our peasant and the endpoint serving it to the leader
struct OwnedPeasant {
    peasant: Arc<Peasant>,
    server: RpcServer,
}

struct WindowManagerShared {
    params: Parameters,
    registry: LeaderRegistry,
    waiter: Arc<dyn ProcessWaiter>,
    executor: Arc<dyn WindowExecutor>,

    /// Raised on teardown to stop the leader monitor
    interrupt: Interrupt,
    /// Serializes elections
    election_lock: Mutex<()>,
    elections: AtomicU64,

    term: Mutex<Option<Term>>,
    peasant: Mutex<Option<OwnedPeasant>>,
    should_create_window: AtomicBool,

    /// Our own subscribers, fed by the monarch while we're the leader
    find_target_window_requested: Arc<Event<FindTargetWindowArgs>>,

    state_tx: watch::Sender<ManagerState>,
    state_rx: watch::Receiver<ManagerState>,

    fatal_error: Mutex<Option<WindowManagerError>>,
    is_monitor_panicked: Arc<AtomicBool>,
}

impl WindowManagerShared {
    fn set_state(&self, state: ManagerState) {
        debug!(pid = %self.params.pid, %state, "State change");
        // we keep a receiver around, so this can't fail
        let _ = self.state_tx.send(state);
    }

    fn state(&self) -> ManagerState {
        *self.state_rx.borrow()
    }

    fn current_leader(&self) -> WindowManagerResult<(LeaderHandle, ProcessId, Role)> {
        self.term
            .lock()
            .expect("Locking failed")
            .as_ref()
            .map(|t| (t.leader.clone(), t.leader_pid, t.role))
            .ok_or(WindowManagerError::ShuttingDown)
    }

    fn role(&self) -> Option<Role> {
        self.term
            .lock()
            .expect("Locking failed")
            .as_ref()
            .map(|t| t.role)
    }

    fn our_peasant(&self) -> Option<(Arc<Peasant>, PathBuf)> {
        self.peasant
            .lock()
            .expect("Locking failed")
            .as_ref()
            .map(|o| (o.peasant.clone(), o.server.path().to_owned()))
    }

    /// Run an election, unless the leader we lost was already replaced
    ///
    /// `lost_leader` of `None` means unconditionally.
    fn elect(&self, lost_leader: Option<ProcessId>) -> WindowManagerResult<Role> {
        let _election = self.election_lock.lock().expect("Locking failed");
        let _span = info_span!("election", pid = %self.params.pid).entered();

        if let Some(lost_leader) = lost_leader {
            if let Ok((_, leader_pid, role)) = self.current_leader() {
                if leader_pid != lost_leader {
                    debug!(%lost_leader, %leader_pid, "Leader already replaced");
                    self.set_state(role.into());
                    return Ok(role);
                }
            }
        }

        loop {
            if self.interrupt.is_raised() {
                return Err(WindowManagerError::ShuttingDown);
            }

            match self.try_elect() {
                Ok(role) => {
                    self.elections.fetch_add(1, Ordering::SeqCst);
                    info!(%role, "Election done");
                    return Ok(role);
                }
                Err(e) if e.is_leader_unreachable() => {
                    warn!(error = %e, "Lost the leader during election, electing again");
                    std::thread::sleep(self.params.claim_retry_period);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn try_elect(&self) -> WindowManagerResult<Role> {
        let leader = self.registry.connect_or_become_leader()?;
        let leader_pid = leader.pid()?;
        let role = if leader_pid == self.params.pid {
            Role::Leader
        } else {
            Role::Follower
        };

        info!(%leader_pid, %role, "Connected to the leader");

        // leader state does not survive a term, tell the new one about us
        if let Some((peasant, endpoint)) = self.our_peasant() {
            leader.add_peasant(&peasant, &endpoint)?;
            if let Some(activated) = peasant.last_activated_args() {
                leader.handle_activate_peasant(&activated)?;
            }
        }

        let subscription = match (role, leader.as_local()) {
            (Role::Leader, Some(monarch)) => {
                let forward_to = self.find_target_window_requested.clone();
                let token = monarch
                    .find_target_window_requested()
                    .subscribe(move |args: &FindTargetWindowArgs| forward_to.raise(args));
                Some((monarch.clone(), token))
            }
            (Role::Leader, None) => {
                warn!(%leader_pid, "Leader has our pid, but is not hosted by us");
                None
            }
            (Role::Follower, _) => None,
        };

        *self.term.lock().expect("Locking failed") = Some(Term {
            leader,
            leader_pid,
            role,
            subscription,
        });

        self.set_state(role.into());

        Ok(role)
    }

    /// Call the leader, electing a new one and retrying if it is gone
    fn with_leader<T>(
        &self,
        f: impl Fn(&LeaderHandle) -> RpcResult<T>,
    ) -> WindowManagerResult<T> {
        loop {
            let (leader, leader_pid, _) = self.current_leader()?;
            match f(&leader) {
                Ok(v) => return Ok(v),
                Err(e) if e.is_unreachable() => {
                    warn!(%leader_pid, error = %e, "Leader unreachable, electing a new one");
                    self.set_state(ManagerState::ReElecting);
                    self.elect(Some(leader_pid))?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn create_our_peasant(&self) -> WindowManagerResult<Arc<Peasant>> {
        if let Some((peasant, _)) = self.our_peasant() {
            return Ok(peasant);
        }

        let peasant = Arc::new(Peasant::new(
            self.params.pid,
            self.params.window_name.clone(),
            self.executor.clone(),
        ));

        let endpoint = self.params.peasant_socket_path();
        match std::fs::remove_file(&endpoint) {
            Ok(()) => debug!(path = %endpoint.display(), "Removed stale peasant socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let server = peasant.serve(&endpoint)?;

        *self.peasant.lock().expect("Locking failed") = Some(OwnedPeasant {
            peasant: peasant.clone(),
            server,
        });

        self.with_leader(|leader| leader.add_peasant(&peasant, &endpoint))?;

        info!(peasant_id = %peasant.id(), "Created our peasant");
        Ok(peasant)
    }

    /// Body of the leader monitor thread
    fn watch_leader(&self) {
        let guard = PanicGuard::new("leader-monitor", self.is_monitor_panicked.clone());
        let _done = scopeguard::guard((), |_| {
            info!("Leader monitor is done");
        });

        loop {
            let Ok((_, leader_pid, role)) = self.current_leader() else {
                break;
            };
            if role == Role::Leader {
                break;
            }

            self.set_state(ManagerState::Watching);
            debug!(%leader_pid, "Watching the leader");

            let outcome = match self.waiter.wait_exit_or_interrupt(leader_pid, &self.interrupt) {
                Ok(outcome) => outcome,
                Err(WaitError::CannotOpen { pid }) => {
                    warn!(%pid, "Can not watch the leader process, assuming it is gone");
                    WaitOutcome::ProcessExited
                }
                Err(e) => {
                    error!(error = %e, "Waiting on the leader failed");
                    *self.fatal_error.lock().expect("Locking failed") = Some(e.into());
                    break;
                }
            };

            match outcome {
                WaitOutcome::Interrupted => {
                    debug!("Leader monitor interrupted");
                    break;
                }
                WaitOutcome::ProcessExited => {
                    info!(
                        %leader_pid,
                        peasant_id = ?self.our_peasant().map(|(p, _)| p.id()),
                        "Leader died"
                    );
                    self.set_state(ManagerState::ReElecting);
                    match self.elect(Some(leader_pid)) {
                        Ok(Role::Leader) => break,
                        Ok(Role::Follower) => continue,
                        Err(WindowManagerError::ShuttingDown) => break,
                        Err(_) if self.interrupt.is_raised() => break,
                        Err(e) => {
                            error!(error = %e, "Election failed");
                            *self.fatal_error.lock().expect("Locking failed") = Some(e);
                            break;
                        }
                    }
                }
            }
        }

        guard.done();
    }
}

/// Ask `leader` where our launch commandline goes
///
/// We might have won an election since deciding to ask: a leader handles
/// its own launch commandline, without routing it anywhere.
fn propose_to_leader(leader: &LeaderHandle, args: &CommandlineArgs) -> RpcResult<bool> {
    match leader {
        LeaderHandle::Local(_) => Ok(true),
        LeaderHandle::Remote(client) => client.propose_commandline(args),
    }
}

/// See module documentation
pub struct WindowManager {
    shared: Arc<WindowManagerShared>,
    candidacy: Mutex<Option<RegistrationToken>>,
    monitor: Mutex<Option<AutoJoinHandle>>,
}

impl WindowManager {
    pub fn new(
        params: Parameters,
        executor: Arc<dyn WindowExecutor>,
    ) -> WindowManagerResult<Self> {
        let waiter = Arc::new(PidWaiter::new(params.liveness_poll_period));
        Self::with_process_waiter(params, executor, waiter)
    }

    pub fn with_process_waiter(
        params: Parameters,
        executor: Arc<dyn WindowExecutor>,
        waiter: Arc<dyn ProcessWaiter>,
    ) -> WindowManagerResult<Self> {
        info!(
            pid = %params.pid,
            runtime_dir = %params.runtime_dir.display(),
            "Starting window manager"
        );

        let (state_tx, state_rx) = watch::channel(ManagerState::Uninitialized);

        let shared = Arc::new(WindowManagerShared {
            registry: LeaderRegistry::new(params.clone())?,
            params,
            waiter,
            executor,
            interrupt: Interrupt::default(),
            election_lock: Mutex::new(()),
            elections: AtomicU64::new(0),
            term: Mutex::new(None),
            peasant: Mutex::new(None),
            should_create_window: AtomicBool::new(false),
            find_target_window_requested: Arc::new(Event::default()),
            state_tx,
            state_rx,
            fatal_error: Mutex::new(None),
            is_monitor_panicked: Arc::new(AtomicBool::new(false)),
        });

        let token = shared.registry.register_candidate();
        shared.set_state(ManagerState::RegisteredCandidate);

        let manager = Self {
            shared,
            candidacy: Mutex::new(Some(token)),
            monitor: Mutex::new(None),
        };

        manager.shared.elect(None)?;

        Ok(manager)
    }

    /// Find out what to do with the commandline this process was launched with
    ///
    /// If the leader says so (or we are the leader), create our window and
    /// execute `args` in it. Otherwise another window took care of it.
    /// Returns [`Self::should_create_window`].
    pub fn propose_commandline(&self, args: &CommandlineArgs) -> WindowManagerResult<bool> {
        let should_create_window = match self.shared.role() {
            // we were launched with it, the leader always handles its own commandline
            Some(Role::Leader) => true,
            _ => self
                .shared
                .with_leader(|leader| propose_to_leader(leader, args))?,
        };

        self.shared
            .should_create_window
            .store(should_create_window, Ordering::SeqCst);

        if !should_create_window {
            info!(%args, "Commandline handled by another window");
            return Ok(false);
        }

        let peasant = self.shared.create_our_peasant()?;

        if self.shared.role() == Some(Role::Follower) {
            self.start_monitor()?;
        }

        peasant.execute_commandline(args);
        if let Some(activated) = peasant.last_activated_args() {
            self.shared
                .with_leader(|leader| leader.handle_activate_peasant(&activated))?;
        }

        Ok(true)
    }

    pub fn should_create_window(&self) -> bool {
        self.shared.should_create_window.load(Ordering::SeqCst)
    }

    /// Our peasant, if this process owns a window
    pub fn current_window(&self) -> Option<Arc<Peasant>> {
        self.shared.our_peasant().map(|(p, _)| p)
    }

    /// Tell the leader our window was just activated
    pub fn activate_window(&self) -> WindowManagerResult<Option<WindowActivatedArgs>> {
        let Some(peasant) = self.current_window() else {
            return Ok(None);
        };
        let activated = peasant.activate();
        self.shared
            .with_leader(|leader| leader.handle_activate_peasant(&activated))?;
        Ok(Some(activated))
    }

    pub fn pid(&self) -> ProcessId {
        self.shared.params.pid
    }

    pub fn role(&self) -> Option<Role> {
        self.shared.role()
    }

    pub fn leader_pid(&self) -> Option<ProcessId> {
        self.shared.current_leader().ok().map(|(_, pid, _)| pid)
    }

    pub fn state(&self) -> ManagerState {
        self.shared.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ManagerState> {
        self.shared.state_rx.clone()
    }

    /// Number of elections completed, including the initial one
    pub fn election_count(&self) -> u64 {
        self.shared.elections.load(Ordering::SeqCst)
    }

    /// Routing policy hook; only raised while this process is the leader
    pub fn find_target_window_requested(&self) -> &Event<FindTargetWindowArgs> {
        &self.shared.find_target_window_requested
    }

    /// Unrecoverable failure of the leader monitor, if any
    ///
    /// Once this returns an error, the process is expected to exit.
    pub fn take_fatal_error(&self) -> Option<WindowManagerError> {
        if let Some(e) = self.shared.fatal_error.lock().expect("Locking failed").take() {
            return Some(e);
        }
        if self.shared.is_monitor_panicked.swap(false, Ordering::SeqCst) {
            return Some(WindowManagerError::MonitorPanicked);
        }
        None
    }

    /// Is the leader monitor thread running
    pub fn is_watching(&self) -> bool {
        self.monitor
            .lock()
            .expect("Locking failed")
            .as_ref()
            .map(|m| !m.is_finished())
            .unwrap_or(false)
    }

    fn start_monitor(&self) -> WindowManagerResult<()> {
        let mut monitor = self.monitor.lock().expect("Locking failed");
        if monitor.as_ref().map(|m| !m.is_finished()).unwrap_or(false) {
            return Ok(());
        }

        let shared = self.shared.clone();
        *monitor = Some(AutoJoinHandle::spawn("leader-monitor", move || {
            shared.watch_leader()
        })?);
        Ok(())
    }
}

impl Drop for WindowManager {
    fn drop(&mut self) {
        self.shared.set_state(ManagerState::ShuttingDown);

        // Revoke first: from here on no election can pick us, even if the
        // leader dies while we're stopping the monitor.
        if let Some(token) = self.candidacy.lock().expect("Locking failed").take() {
            self.shared.registry.revoke(token);
        }
        self.shared.interrupt.raise();
        if let Some(monitor) = self.monitor.lock().expect("Locking failed").take() {
            drop(monitor);
            debug!("Leader monitor joined");
        }

        self.shared.term.lock().expect("Locking failed").take();
        self.shared.peasant.lock().expect("Locking failed").take();
        self.shared.registry.shutdown();

        info!(pid = %self.shared.params.pid, "Window manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_failures_mean_leader_unreachable() {
        let unreachable = WindowManagerError::Rpc(RpcError::Io(io::Error::from(
            io::ErrorKind::ConnectionReset,
        )));
        assert!(unreachable.is_leader_unreachable());
        assert!(!WindowManagerError::Rpc(RpcError::Remote("nope".into())).is_leader_unreachable());
        assert!(!WindowManagerError::ShuttingDown.is_leader_unreachable());
        assert_eq!(ManagerState::from(Role::Follower), ManagerState::Follower);
    }

    #[derive(Default)]
    struct RecordingExecutor {
        executed: Mutex<Vec<CommandlineArgs>>,
    }

    impl WindowExecutor for RecordingExecutor {
        fn execute(&self, _peasant_id: windowd_api::PeasantId, args: &CommandlineArgs) {
            self.executed.lock().unwrap().push(args.clone());
        }
    }

    #[test]
    fn hosted_leader_keeps_its_own_launch_commandline() {
        let monarch = Arc::new(Monarch::new(ProcessId(1)));
        monarch
            .find_target_window_requested()
            .subscribe(crate::routing::route_by_window_flag);

        let executor = Arc::new(RecordingExecutor::default());
        let window = Arc::new(Peasant::new(ProcessId(2), None, executor.clone()));
        monarch.add_peasant(window);

        let args = CommandlineArgs::new(vec!["-w".into(), "last".into()], "/");
        // routed by the monarch itself, the commandline would land in the existing window
        assert!(propose_to_leader(&LeaderHandle::Local(monarch), &args).unwrap());
        assert!(executor.executed.lock().unwrap().is_empty());
    }
}
