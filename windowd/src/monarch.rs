//! The monarch: the leader process' registry of peasants
//!
//! Exactly one process hosts a [`Monarch`] per election term. Everyone else
//! talks to it through a [`MonarchClient`]. [`LeaderHandle`] hides which one
//! of the two a process got from the registry.
use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};
use windowd_api::{
    AddPeasantRequest, AddPeasantResponse, CommandlineArgs, GetPidResponse, PeasantId, ProcessId,
    ProposeCommandlineResponse, RequestCmd, WindowActivatedArgs,
};

use crate::event::Event;
use crate::peasant::{now_ms, Peasant, PeasantClient, PeasantHandle};
use crate::rpc::{
    decode_payload, encode_payload, RequestError, RequestHandler, RequestResult, RpcConnection,
    RpcResult, RpcServer,
};

/// Where a commandline should go, as decided by the routing policy
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WindowTarget {
    /// Create a new window for it
    New,
    /// The most recently activated window
    MostRecent,
    /// Window with the given id, or a new one if there's no such window
    Id(PeasantId),
}

/// Arguments of the `FindTargetWindowRequested` event
///
/// Subscribers inspect the commandline and may set the result. No result
/// means [`WindowTarget::New`].
#[derive(Debug)]
pub struct FindTargetWindowArgs {
    args: CommandlineArgs,
    result: Mutex<Option<WindowTarget>>,
}

impl FindTargetWindowArgs {
    pub fn new(args: CommandlineArgs) -> Self {
        Self {
            args,
            result: Mutex::new(None),
        }
    }

    pub fn args(&self) -> &CommandlineArgs {
        &self.args
    }

    pub fn set_result_target_window(&self, target: WindowTarget) {
        *self.result.lock().expect("Locking failed") = Some(target);
    }

    pub fn result_target_window(&self) -> Option<WindowTarget> {
        *self.result.lock().expect("Locking failed")
    }
}

struct Activation {
    args: WindowActivatedArgs,
    /// Order of reporting, to break timestamp ties
    seq: u64,
}

struct MonarchState {
    peasants: HashMap<PeasantId, Arc<dyn PeasantHandle>>,
    next_peasant_id: PeasantId,
    activations: HashMap<PeasantId, Activation>,
    next_activation_seq: u64,
}

pub struct Monarch {
    pid: ProcessId,
    state: Mutex<MonarchState>,
    find_target_window_requested: Event<FindTargetWindowArgs>,
}

impl Monarch {
    pub fn new(pid: ProcessId) -> Self {
        info!(%pid, "New monarch");
        Self {
            pid,
            state: Mutex::new(MonarchState {
                peasants: HashMap::new(),
                next_peasant_id: PeasantId::UNASSIGNED.next(),
                activations: HashMap::new(),
                next_activation_seq: 0,
            }),
            find_target_window_requested: Event::default(),
        }
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn find_target_window_requested(&self) -> &Event<FindTargetWindowArgs> {
        &self.find_target_window_requested
    }

    /// Register `peasant`, assigning it an id if it has none
    ///
    /// Registering the same peasant again is a no-op, apart from replacing
    /// the handle kept for it.
    pub fn add_peasant(&self, peasant: Arc<dyn PeasantHandle>) -> PeasantId {
        let mut state = self.state.lock().expect("Locking failed");

        let id = peasant.id();
        let id = if id.is_assigned() {
            // peasant from an older term keeps its id, make sure we never hand it out again
            if state.next_peasant_id <= id {
                state.next_peasant_id = id.next();
            }
            id
        } else {
            let mut id = state.next_peasant_id;
            // only after wrapping around can the id be taken
            while state.peasants.contains_key(&id) {
                id = id.next();
            }
            state.next_peasant_id = id.next();
            peasant.assign_id(id);
            id
        };

        debug!(peasant_id = %id, peasant_pid = %peasant.pid(), "Adding peasant");
        state.peasants.insert(id, peasant);
        id
    }

    pub fn peasant_ids(&self) -> Vec<PeasantId> {
        let mut ids: Vec<_> = self
            .state
            .lock()
            .expect("Locking failed")
            .peasants
            .keys()
            .copied()
            .collect();
        ids.sort();
        ids
    }

    /// Decide what to do with a commandline
    ///
    /// Returns `true` if the caller should create a window for it. If an
    /// existing window is chosen, the commandline gets executed there before
    /// returning `false`.
    pub fn propose_commandline(&self, args: &CommandlineArgs) -> bool {
        let find_args = FindTargetWindowArgs::new(args.clone());
        self.find_target_window_requested.raise(&find_args);
        let target = find_args
            .result_target_window()
            .unwrap_or(WindowTarget::New);

        debug!(?target, %args, "Routing commandline");

        let peasant = match target {
            WindowTarget::New => return true,
            WindowTarget::Id(id) => self.peasant(id),
            WindowTarget::MostRecent => self.most_recent_peasant(),
        };

        let Some(peasant) = peasant else {
            debug!(?target, "No such window, a new one will be created");
            return true;
        };

        let peasant_id = peasant.id();
        match peasant.execute_commandline(args) {
            Ok(()) => {
                self.handle_activate_peasant(WindowActivatedArgs {
                    peasant_id,
                    activated_at_ms: now_ms(),
                });
                false
            }
            Err(e) => {
                warn!(%peasant_id, error = %e, "Could not hand commandline to peasant");
                if e.is_unreachable() {
                    self.remove_peasant(peasant_id);
                }
                true
            }
        }
    }

    /// Remember when a window was activated; newest timestamp wins
    pub fn handle_activate_peasant(&self, args: WindowActivatedArgs) {
        if !args.peasant_id.is_assigned() {
            return;
        }
        let mut state = self.state.lock().expect("Locking failed");
        let seq = state.next_activation_seq;
        state.next_activation_seq += 1;

        let is_newer = state
            .activations
            .get(&args.peasant_id)
            .map(|prev| prev.args.activated_at_ms <= args.activated_at_ms)
            .unwrap_or(true);
        if is_newer {
            state
                .activations
                .insert(args.peasant_id, Activation { args, seq });
        }
    }

    pub fn serve(self: &Arc<Self>, path: &Path) -> io::Result<RpcServer> {
        RpcServer::bind(
            "monarch-server",
            path,
            self.pid,
            Arc::new(MonarchRequestHandler {
                monarch: self.clone(),
            }),
        )
    }

    fn peasant(&self, id: PeasantId) -> Option<Arc<dyn PeasantHandle>> {
        self.state
            .lock()
            .expect("Locking failed")
            .peasants
            .get(&id)
            .cloned()
    }

    /// Most recently activated registered peasant, or the newest one if
    /// none reported an activation
    fn most_recent_peasant(&self) -> Option<Arc<dyn PeasantHandle>> {
        let state = self.state.lock().expect("Locking failed");
        state
            .activations
            .values()
            .filter(|a| state.peasants.contains_key(&a.args.peasant_id))
            .max_by_key(|a| (a.args.activated_at_ms, a.seq))
            .map(|a| a.args.peasant_id)
            .or_else(|| state.peasants.keys().max().copied())
            .and_then(|id| state.peasants.get(&id).cloned())
    }

    fn remove_peasant(&self, id: PeasantId) {
        let mut state = self.state.lock().expect("Locking failed");
        info!(peasant_id = %id, "Removing unreachable peasant");
        state.peasants.remove(&id);
        state.activations.remove(&id);
    }
}

struct MonarchRequestHandler {
    monarch: Arc<Monarch>,
}

impl RequestHandler for MonarchRequestHandler {
    fn handle_request(&self, cmd: RequestCmd, payload: &[u8]) -> RequestResult<Vec<u8>> {
        match cmd {
            RequestCmd::GetPid => encode_payload(&GetPidResponse {
                pid: self.monarch.pid(),
            }),
            RequestCmd::AddPeasant => {
                let req: AddPeasantRequest = decode_payload(payload)?;
                let id = self.monarch.add_peasant(Arc::new(PeasantClient::new(
                    req.id,
                    req.pid,
                    req.name,
                    req.endpoint,
                )));
                encode_payload(&AddPeasantResponse { id })
            }
            RequestCmd::ProposeCommandline => {
                let args: CommandlineArgs = decode_payload(payload)?;
                encode_payload(&ProposeCommandlineResponse {
                    create_window: self.monarch.propose_commandline(&args),
                })
            }
            RequestCmd::HandleActivatePeasant => {
                let args: WindowActivatedArgs = decode_payload(payload)?;
                self.monarch.handle_activate_peasant(args);
                encode_payload(&())
            }
            cmd => Err(RequestError::Unsupported(cmd)),
        }
    }
}

/// Proxy to a monarch living in another process
///
/// Holds a single connection for its whole life: once it breaks, the
/// monarch is considered gone.
pub struct MonarchClient {
    conn: Mutex<RpcConnection>,
}

impl MonarchClient {
    pub fn connect(path: &Path) -> RpcResult<Self> {
        Ok(Self {
            conn: Mutex::new(RpcConnection::connect(path)?),
        })
    }

    fn call<Req, Resp>(&self, cmd: RequestCmd, req: &Req) -> RpcResult<Resp>
    where
        Req: serde::Serialize + ?Sized,
        Resp: serde::de::DeserializeOwned,
    {
        self.conn.lock().expect("Locking failed").call(cmd, req)
    }

    pub fn pid(&self) -> RpcResult<ProcessId> {
        let resp: GetPidResponse = self.call(RequestCmd::GetPid, &())?;
        Ok(resp.pid)
    }

    pub fn add_peasant(&self, peasant: &Peasant, endpoint: &Path) -> RpcResult<PeasantId> {
        let resp: AddPeasantResponse = self.call(
            RequestCmd::AddPeasant,
            &AddPeasantRequest {
                id: peasant.id(),
                pid: peasant.pid(),
                name: peasant.name().map(ToOwned::to_owned),
                endpoint: endpoint.to_owned(),
            },
        )?;
        peasant.assign_id(resp.id);
        Ok(resp.id)
    }

    pub fn propose_commandline(&self, args: &CommandlineArgs) -> RpcResult<bool> {
        let resp: ProposeCommandlineResponse = self.call(RequestCmd::ProposeCommandline, args)?;
        Ok(resp.create_window)
    }

    pub fn handle_activate_peasant(&self, args: &WindowActivatedArgs) -> RpcResult<()> {
        self.call(RequestCmd::HandleActivatePeasant, args)
    }
}

/// The leader of the current term, wherever it lives
#[derive(Clone)]
pub enum LeaderHandle {
    /// This process is the leader
    Local(Arc<Monarch>),
    Remote(Arc<MonarchClient>),
}

impl LeaderHandle {
    pub fn pid(&self) -> RpcResult<ProcessId> {
        match self {
            LeaderHandle::Local(monarch) => Ok(monarch.pid()),
            LeaderHandle::Remote(client) => client.pid(),
        }
    }

    /// Register our peasant; `endpoint` is where a remote leader can reach it
    pub fn add_peasant(&self, peasant: &Arc<Peasant>, endpoint: &Path) -> RpcResult<PeasantId> {
        match self {
            LeaderHandle::Local(monarch) => Ok(monarch.add_peasant(peasant.clone())),
            LeaderHandle::Remote(client) => client.add_peasant(peasant, endpoint),
        }
    }

    pub fn propose_commandline(&self, args: &CommandlineArgs) -> RpcResult<bool> {
        match self {
            LeaderHandle::Local(monarch) => Ok(monarch.propose_commandline(args)),
            LeaderHandle::Remote(client) => client.propose_commandline(args),
        }
    }

    pub fn handle_activate_peasant(&self, args: &WindowActivatedArgs) -> RpcResult<()> {
        match self {
            LeaderHandle::Local(monarch) => {
                monarch.handle_activate_peasant(*args);
                Ok(())
            }
            LeaderHandle::Remote(client) => client.handle_activate_peasant(args),
        }
    }

    pub fn as_local(&self) -> Option<&Arc<Monarch>> {
        match self {
            LeaderHandle::Local(monarch) => Some(monarch),
            LeaderHandle::Remote(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peasant::WindowExecutor;
    use crate::rpc::RpcError;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// In-memory peasant that counts executions
    struct FakePeasant {
        id: AtomicU64,
        executed: Mutex<Vec<CommandlineArgs>>,
        reachable: bool,
    }

    impl FakePeasant {
        fn new(id: PeasantId) -> Arc<Self> {
            Arc::new(Self {
                id: AtomicU64::new(id.0),
                executed: Mutex::new(vec![]),
                reachable: true,
            })
        }

        fn unreachable() -> Arc<Self> {
            Arc::new(Self {
                id: AtomicU64::new(0),
                executed: Mutex::new(vec![]),
                reachable: false,
            })
        }
    }

    impl PeasantHandle for FakePeasant {
        fn id(&self) -> PeasantId {
            PeasantId(self.id.load(Ordering::SeqCst))
        }
        fn assign_id(&self, id: PeasantId) {
            self.id.store(id.0, Ordering::SeqCst)
        }
        fn pid(&self) -> ProcessId {
            ProcessId(1)
        }
        fn execute_commandline(&self, args: &CommandlineArgs) -> RpcResult<()> {
            if !self.reachable {
                return Err(RpcError::Io(io::ErrorKind::ConnectionRefused.into()));
            }
            self.executed.lock().unwrap().push(args.clone());
            Ok(())
        }
        fn last_activated_args(&self) -> RpcResult<Option<WindowActivatedArgs>> {
            Ok(None)
        }
    }

    fn args(a: &[&str]) -> CommandlineArgs {
        CommandlineArgs::new(a.iter().map(|s| s.to_string()).collect(), "/")
    }

    fn route_to(monarch: &Monarch, target: WindowTarget) {
        monarch
            .find_target_window_requested()
            .subscribe(move |a: &FindTargetWindowArgs| a.set_result_target_window(target));
    }

    #[test]
    fn add_peasant_assigns_fresh_ids() {
        let monarch = Monarch::new(ProcessId(10));
        let a = FakePeasant::new(PeasantId::UNASSIGNED);
        let b = FakePeasant::new(PeasantId::UNASSIGNED);

        assert_eq!(monarch.add_peasant(a.clone()), PeasantId(1));
        assert_eq!(monarch.add_peasant(b.clone()), PeasantId(2));
        assert_eq!(a.id(), PeasantId(1));
        assert_eq!(b.id(), PeasantId(2));

        // again, with the id already set
        assert_eq!(monarch.add_peasant(a), PeasantId(1));
        assert_eq!(monarch.peasant_ids(), [PeasantId(1), PeasantId(2)]);
    }

    #[test]
    fn fresh_ids_wrap_around_past_the_largest_one() {
        let monarch = Monarch::new(ProcessId(10));
        assert_eq!(monarch.add_peasant(FakePeasant::new(PeasantId(1))), PeasantId(1));
        assert_eq!(
            monarch.add_peasant(FakePeasant::new(PeasantId(u64::MAX))),
            PeasantId(u64::MAX)
        );
        assert_eq!(
            monarch.add_peasant(FakePeasant::new(PeasantId::UNASSIGNED)),
            PeasantId(2)
        );
        assert_eq!(
            monarch.peasant_ids(),
            [PeasantId(1), PeasantId(2), PeasantId(u64::MAX)]
        );
    }

    #[test]
    fn re_registered_ids_are_never_reused() {
        let monarch = Monarch::new(ProcessId(10));
        assert_eq!(monarch.add_peasant(FakePeasant::new(PeasantId(7))), PeasantId(7));
        assert_eq!(
            monarch.add_peasant(FakePeasant::new(PeasantId::UNASSIGNED)),
            PeasantId(8)
        );
        assert_eq!(monarch.add_peasant(FakePeasant::new(PeasantId(3))), PeasantId(3));
        assert_eq!(
            monarch.add_peasant(FakePeasant::new(PeasantId::UNASSIGNED)),
            PeasantId(9)
        );
    }

    #[test]
    fn no_routing_policy_means_new_window() {
        let monarch = Monarch::new(ProcessId(10));
        let existing = FakePeasant::new(PeasantId::UNASSIGNED);
        monarch.add_peasant(existing.clone());

        assert!(monarch.propose_commandline(&args(&["a"])));
        assert!(existing.executed.lock().unwrap().is_empty());
    }

    #[test]
    fn routing_to_existing_window_executes_there_once() {
        let monarch = Monarch::new(ProcessId(10));
        let first = FakePeasant::new(PeasantId::UNASSIGNED);
        let second = FakePeasant::new(PeasantId::UNASSIGNED);
        monarch.add_peasant(first.clone());
        monarch.add_peasant(second.clone());
        route_to(&monarch, WindowTarget::Id(PeasantId(2)));

        assert!(!monarch.propose_commandline(&args(&["b"])));

        assert!(first.executed.lock().unwrap().is_empty());
        assert_eq!(*second.executed.lock().unwrap(), [args(&["b"])]);
    }

    #[test]
    fn routing_to_missing_window_creates_new() {
        let monarch = Monarch::new(ProcessId(10));
        route_to(&monarch, WindowTarget::Id(PeasantId(42)));
        assert!(monarch.propose_commandline(&args(&["c"])));
    }

    #[test]
    fn most_recent_follows_activations() {
        let monarch = Monarch::new(ProcessId(10));
        let first = FakePeasant::new(PeasantId::UNASSIGNED);
        let second = FakePeasant::new(PeasantId::UNASSIGNED);
        monarch.add_peasant(first.clone());
        monarch.add_peasant(second.clone());
        route_to(&monarch, WindowTarget::MostRecent);

        monarch.handle_activate_peasant(WindowActivatedArgs {
            peasant_id: PeasantId(2),
            activated_at_ms: 100,
        });
        monarch.handle_activate_peasant(WindowActivatedArgs {
            peasant_id: PeasantId(1),
            activated_at_ms: 200,
        });
        // stale report does not win
        monarch.handle_activate_peasant(WindowActivatedArgs {
            peasant_id: PeasantId(2),
            activated_at_ms: 50,
        });

        assert!(!monarch.propose_commandline(&args(&["d"])));
        assert_eq!(*first.executed.lock().unwrap(), [args(&["d"])]);
        assert!(second.executed.lock().unwrap().is_empty());
    }

    #[test]
    fn most_recent_without_windows_creates_new() {
        let monarch = Monarch::new(ProcessId(10));
        route_to(&monarch, WindowTarget::MostRecent);
        assert!(monarch.propose_commandline(&args(&["e"])));
    }

    #[test]
    fn unreachable_peasant_is_dropped() {
        let monarch = Monarch::new(ProcessId(10));
        let id = monarch.add_peasant(FakePeasant::unreachable());
        route_to(&monarch, WindowTarget::Id(id));

        assert!(monarch.propose_commandline(&args(&["f"])));
        assert!(monarch.peasant_ids().is_empty());
    }

    struct NoopExecutor;

    impl WindowExecutor for NoopExecutor {
        fn execute(&self, _: PeasantId, _: &CommandlineArgs) {}
    }

    #[test]
    fn client_talks_to_served_monarch() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let monarch = Arc::new(Monarch::new(ProcessId(31)));
        let server = monarch.serve(&dir.path().join("monarch.sock"))?;

        let client = MonarchClient::connect(server.path())?;
        assert_eq!(client.pid()?, ProcessId(31));

        let peasant = Peasant::new(ProcessId(32), Some("w".into()), Arc::new(NoopExecutor));
        let id = client.add_peasant(&peasant, &dir.path().join("peasant.sock"))?;
        assert_eq!(id, PeasantId(1));
        assert_eq!(peasant.id(), PeasantId(1));
        assert_eq!(monarch.peasant_ids(), [PeasantId(1)]);

        assert!(client.propose_commandline(&args(&["g"]))?);

        drop(server);
        assert!(client.pid().unwrap_err().is_unreachable());
        Ok(())
    }
}
