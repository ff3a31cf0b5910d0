//! Peasants: one per process that owns a window
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info};
use windowd_api::{
    CommandlineArgs, GetIdResponse, LastActivatedResponse, PeasantId, ProcessId, RequestCmd,
    WindowActivatedArgs,
};

use crate::rpc::{
    decode_payload, encode_payload, RequestError, RequestHandler, RequestResult, RpcConnection,
    RpcError, RpcResult, RpcServer,
};

/// The part of the application that actually owns windows
pub trait WindowExecutor: Send + Sync + 'static {
    fn execute(&self, peasant_id: PeasantId, args: &CommandlineArgs);
}

/// A peasant, as the leader sees it
///
/// Either a [`Peasant`] living in the leader process, or a
/// [`PeasantClient`] proxy to one living in another process.
pub trait PeasantHandle: Send + Sync {
    fn id(&self) -> PeasantId;
    fn assign_id(&self, id: PeasantId);
    fn pid(&self) -> ProcessId;
    fn execute_commandline(&self, args: &CommandlineArgs) -> RpcResult<()>;
    fn last_activated_args(&self) -> RpcResult<Option<WindowActivatedArgs>>;
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

pub struct Peasant {
    id: AtomicU64,
    pid: ProcessId,
    name: Option<String>,
    last_activated: Mutex<Option<WindowActivatedArgs>>,
    executor: Arc<dyn WindowExecutor>,
}

impl Peasant {
    pub fn new(pid: ProcessId, name: Option<String>, executor: Arc<dyn WindowExecutor>) -> Self {
        Self {
            id: AtomicU64::new(PeasantId::UNASSIGNED.0),
            pid,
            name,
            last_activated: Mutex::new(None),
            executor,
        }
    }

    pub fn id(&self) -> PeasantId {
        PeasantId(self.id.load(Ordering::SeqCst))
    }

    pub fn assign_id(&self, id: PeasantId) {
        self.id.store(id.0, Ordering::SeqCst);
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Run `args` in this window
    pub fn execute_commandline(&self, args: &CommandlineArgs) {
        let id = self.id();
        info!(peasant_id = %id, %args, "Executing commandline");
        self.executor.execute(id, args);
        self.activate();
    }

    /// Record that the window was just activated
    pub fn activate(&self) -> WindowActivatedArgs {
        let args = WindowActivatedArgs {
            peasant_id: self.id(),
            activated_at_ms: now_ms(),
        };
        *self.last_activated.lock().expect("Locking failed") = Some(args);
        args
    }

    pub fn last_activated_args(&self) -> Option<WindowActivatedArgs> {
        *self.last_activated.lock().expect("Locking failed")
    }

    /// Start accepting leader requests for this peasant at `path`
    pub fn serve(self: &Arc<Self>, path: &Path) -> io::Result<RpcServer> {
        RpcServer::bind(
            "peasant-server",
            path,
            self.pid,
            Arc::new(PeasantRequestHandler {
                peasant: self.clone(),
            }),
        )
    }
}

impl PeasantHandle for Peasant {
    fn id(&self) -> PeasantId {
        Peasant::id(self)
    }

    fn assign_id(&self, id: PeasantId) {
        Peasant::assign_id(self, id)
    }

    fn pid(&self) -> ProcessId {
        self.pid
    }

    fn execute_commandline(&self, args: &CommandlineArgs) -> RpcResult<()> {
        Peasant::execute_commandline(self, args);
        Ok(())
    }

    fn last_activated_args(&self) -> RpcResult<Option<WindowActivatedArgs>> {
        Ok(Peasant::last_activated_args(self))
    }
}

struct PeasantRequestHandler {
    peasant: Arc<Peasant>,
}

impl RequestHandler for PeasantRequestHandler {
    fn handle_request(&self, cmd: RequestCmd, payload: &[u8]) -> RequestResult<Vec<u8>> {
        match cmd {
            RequestCmd::GetId => encode_payload(&GetIdResponse {
                id: self.peasant.id(),
            }),
            RequestCmd::ExecuteCommandline => {
                let args: CommandlineArgs = decode_payload(payload)?;
                self.peasant.execute_commandline(&args);
                encode_payload(&())
            }
            RequestCmd::GetLastActivatedArgs => encode_payload(&LastActivatedResponse {
                args: self.peasant.last_activated_args(),
            }),
            cmd => Err(RequestError::Unsupported(cmd)),
        }
    }
}

/// Proxy to a peasant living in another process
pub struct PeasantClient {
    id: AtomicU64,
    pid: ProcessId,
    name: Option<String>,
    endpoint: PathBuf,
    conn: Mutex<Option<RpcConnection>>,
}

impl PeasantClient {
    pub fn new(id: PeasantId, pid: ProcessId, name: Option<String>, endpoint: PathBuf) -> Self {
        Self {
            id: AtomicU64::new(id.0),
            pid,
            name,
            endpoint,
            conn: Mutex::new(None),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    /// Make a call, (re)connecting if needed
    ///
    /// A failed connection is discarded, so the next call tries afresh.
    fn call<Req, Resp>(&self, cmd: RequestCmd, req: &Req) -> RpcResult<Resp>
    where
        Req: serde::Serialize + ?Sized,
        Resp: serde::de::DeserializeOwned,
    {
        let mut conn = self.conn.lock().expect("Locking failed");
        let connected = match conn.take() {
            Some(connected) => connected,
            None => {
                let connected = RpcConnection::connect(&self.endpoint)?;
                // endpoint left behind by a process that reused the path
                if connected.remote_pid() != self.pid {
                    return Err(RpcError::UnexpectedPeer {
                        expected: self.pid,
                        actual: connected.remote_pid(),
                    });
                }
                connected
            }
        };
        let res = conn.insert(connected).call(cmd, req);
        if let Err(ref e) = res {
            if e.is_unreachable() {
                debug!(pid = %self.pid, error = %e, "Peasant connection lost");
                *conn = None;
            }
        }
        res
    }
}

impl PeasantHandle for PeasantClient {
    fn id(&self) -> PeasantId {
        PeasantId(self.id.load(Ordering::SeqCst))
    }

    fn assign_id(&self, id: PeasantId) {
        self.id.store(id.0, Ordering::SeqCst);
    }

    fn pid(&self) -> ProcessId {
        self.pid
    }

    fn execute_commandline(&self, args: &CommandlineArgs) -> RpcResult<()> {
        self.call(RequestCmd::ExecuteCommandline, args)
    }

    fn last_activated_args(&self) -> RpcResult<Option<WindowActivatedArgs>> {
        let resp: LastActivatedResponse = self.call(RequestCmd::GetLastActivatedArgs, &())?;
        Ok(resp.args)
    }
}
