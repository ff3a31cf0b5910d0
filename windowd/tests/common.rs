#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use windowd::{
    routing, Interrupt, Parameters, ProcessWaiter, WaitError, WaitOutcome, WindowExecutor,
    WindowManager,
};
use windowd_api::{CommandlineArgs, PeasantId, ProcessId};

/// Commandlines executed by one process' window
#[derive(Default)]
pub struct RecordingExecutor {
    executed: Mutex<Vec<(PeasantId, CommandlineArgs)>>,
}

impl RecordingExecutor {
    pub fn executed(&self) -> Vec<(PeasantId, CommandlineArgs)> {
        self.executed.lock().unwrap().clone()
    }

    pub fn executed_args(&self) -> Vec<Vec<String>> {
        self.executed()
            .into_iter()
            .map(|(_, args)| args.args().to_vec())
            .collect()
    }
}

impl WindowExecutor for RecordingExecutor {
    fn execute(&self, id: PeasantId, args: &CommandlineArgs) {
        self.executed.lock().unwrap().push((id, args.clone()));
    }
}

/// Table of fake processes: waiting on one returns once it is marked dead
#[derive(Default)]
pub struct FakeProcesses {
    dead: Mutex<HashSet<ProcessId>>,
}

impl FakeProcesses {
    pub fn kill(&self, pid: ProcessId) {
        self.dead.lock().unwrap().insert(pid);
    }
}

impl ProcessWaiter for FakeProcesses {
    fn wait_exit_or_interrupt(
        &self,
        pid: ProcessId,
        interrupt: &Interrupt,
    ) -> Result<WaitOutcome, WaitError> {
        loop {
            if interrupt.is_raised() {
                return Ok(WaitOutcome::Interrupted);
            }
            if self.dead.lock().unwrap().contains(&pid) {
                return Ok(WaitOutcome::ProcessExited);
            }
            if interrupt.wait_timeout(Duration::from_millis(5)) {
                return Ok(WaitOutcome::Interrupted);
            }
        }
    }
}

/// Fails the first waits with the given errors, then waits on [`FakeProcesses`]
pub struct ScriptedWaiter {
    failures: Mutex<VecDeque<WaitError>>,
    processes: Arc<FakeProcesses>,
}

impl ScriptedWaiter {
    pub fn new(failures: Vec<WaitError>, processes: Arc<FakeProcesses>) -> Self {
        Self {
            failures: Mutex::new(failures.into()),
            processes,
        }
    }
}

impl ProcessWaiter for ScriptedWaiter {
    fn wait_exit_or_interrupt(
        &self,
        pid: ProcessId,
        interrupt: &Interrupt,
    ) -> Result<WaitOutcome, WaitError> {
        if let Some(e) = self.failures.lock().unwrap().pop_front() {
            return Err(e);
        }
        self.processes.wait_exit_or_interrupt(pid, interrupt)
    }
}

/// A set of in-process "processes" sharing one runtime dir
pub struct TestWorld {
    dir: tempfile::TempDir,
    pub processes: Arc<FakeProcesses>,
}

/// One fake process: its manager and what its window executed
pub struct TestProcess {
    pub pid: ProcessId,
    pub executor: Arc<RecordingExecutor>,
    pub manager: Option<WindowManager>,
}

impl TestProcess {
    pub fn manager(&self) -> &WindowManager {
        self.manager.as_ref().expect("process already stopped")
    }

    pub fn propose(&self, args: &[&str]) -> anyhow::Result<bool> {
        Ok(self.manager().propose_commandline(&commandline(args))?)
    }
}

impl TestWorld {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            dir: tempfile::tempdir()?,
            processes: Arc::new(FakeProcesses::default()),
        })
    }

    pub fn runtime_dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn params(&self, pid: u32) -> Parameters {
        Parameters::builder()
            .runtime_dir(self.dir.path().to_owned())
            .pid(ProcessId(pid))
            .window_name(Some(format!("window-{pid}")))
            .build()
    }

    /// Start a process with the `-w` routing policy subscribed
    pub fn start(&self, pid: u32) -> anyhow::Result<TestProcess> {
        self.start_with_waiter(pid, self.processes.clone())
    }

    pub fn start_with_waiter(
        &self,
        pid: u32,
        waiter: Arc<dyn ProcessWaiter>,
    ) -> anyhow::Result<TestProcess> {
        let executor = Arc::new(RecordingExecutor::default());
        let manager = WindowManager::with_process_waiter(self.params(pid), executor.clone(), waiter)?;
        manager
            .find_target_window_requested()
            .subscribe(routing::route_by_window_flag);
        Ok(TestProcess {
            pid: ProcessId(pid),
            executor,
            manager: Some(manager),
        })
    }

    /// Simulate the process dying: everything it held goes away, then it is gone
    pub fn kill(&self, process: &mut TestProcess) {
        drop(process.manager.take());
        self.processes.kill(process.pid);
    }
}

pub fn commandline(args: &[&str]) -> CommandlineArgs {
    CommandlineArgs::new(args.iter().map(|s| s.to_string()).collect(), "/")
}

pub fn wait_until(what: &str, mut f: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !f() {
        assert!(Instant::now() < deadline, "timed out waiting for: {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}
