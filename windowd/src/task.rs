use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::{fmt, io, thread};

use tracing::{error, warn};

/// Thread handle that joins the thread when dropped
pub struct AutoJoinHandle {
    pub(crate) join_handle: Option<JoinHandle<()>>,
}

impl AutoJoinHandle {
    pub fn spawn<F>(name: &str, f: F) -> io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        Ok(Self::from(
            thread::Builder::new().name(name.to_owned()).spawn(f)?,
        ))
    }

    /// Like [`Self::spawn`], but logs the error `f` might return
    pub fn spawn_res<F, E>(name: &'static str, f: F) -> io::Result<Self>
    where
        F: FnOnce() -> std::result::Result<(), E>,
        F: Send + 'static,
        E: Send + fmt::Debug + 'static,
    {
        Self::spawn(name, move || {
            if let Err(e) = f() {
                error!(task = name, error = ?e, "Task failed");
            }
        })
    }

    pub fn is_finished(&self) -> bool {
        self.join_handle
            .as_ref()
            .map(JoinHandle::is_finished)
            .unwrap_or(true)
    }
}

impl From<JoinHandle<()>> for AutoJoinHandle {
    fn from(value: JoinHandle<()>) -> Self {
        Self {
            join_handle: Some(value),
        }
    }
}

impl Drop for AutoJoinHandle {
    fn drop(&mut self) {
        let join_handle = self.join_handle.take().expect("Missing join handle");
        // A task dropping its own handle can't join itself
        if join_handle.thread().id() == thread::current().id() {
            return;
        }
        if join_handle.join().is_err() {
            warn!("Task thread panicked");
        }
    }
}

/// Raises a flag if the task owning it unwinds before calling [`PanicGuard::done`]
pub struct PanicGuard {
    name: &'static str,
    flag: Arc<AtomicBool>,
    done: bool,
}

impl PanicGuard {
    pub fn new(name: &'static str, flag: Arc<AtomicBool>) -> Self {
        Self {
            name,
            flag,
            done: false,
        }
    }

    pub fn done(mut self) {
        self.done = true;
    }
}

impl Drop for PanicGuard {
    fn drop(&mut self) {
        if !self.done {
            warn!("Task {} panic detected via PanicGuard", self.name);
            self.flag.store(true, Ordering::SeqCst);
        }
    }
}

#[test]
fn panic_guard_raises_flag_on_unwind() {
    let flag = Arc::new(AtomicBool::new(false));

    let handle = AutoJoinHandle::spawn("panicky", {
        let flag = flag.clone();
        move || {
            let _guard = PanicGuard::new("panicky", flag);
            panic!("boom");
        }
    })
    .unwrap();
    drop(handle);

    assert!(flag.load(Ordering::SeqCst));
}

#[test]
fn panic_guard_done_keeps_flag_down() {
    let flag = Arc::new(AtomicBool::new(false));

    drop(
        AutoJoinHandle::spawn("calm", {
            let flag = flag.clone();
            move || {
                PanicGuard::new("calm", flag).done();
            }
        })
        .unwrap(),
    );

    assert!(!flag.load(Ordering::SeqCst));
}
