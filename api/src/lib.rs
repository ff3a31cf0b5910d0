use binrw::{BinRead, BinWrite};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

mod net;
pub use self::net::*;

mod rpc;
pub use self::rpc::*;

/// OS process id of a participant
///
/// Every process compares the pid of the leader it got
/// connected to with its own to find out if it is the leader.
#[derive(
    Copy,
    Clone,
    Debug,
    BinRead,
    BinWrite,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
)]
#[br(big)]
#[bw(big)]
pub struct ProcessId(pub u32);

impl ProcessId {
    pub const BYTE_SIZE: usize = 4;

    pub fn current() -> Self {
        Self(std::process::id())
    }
}

/// Id of a peasant (a window)
///
/// Assigned by the leader when the peasant registers. Survives
/// leader changes: a peasant re-registering with a new leader keeps it.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
)]
pub struct PeasantId(pub u64);

impl PeasantId {
    /// Peasant that was not registered with any leader yet
    pub const UNASSIGNED: PeasantId = PeasantId(0);

    pub fn is_assigned(self) -> bool {
        self != Self::UNASSIGNED
    }

    /// The following id, wrapping around to the first assignable one
    pub fn next(self) -> Self {
        Self(self.0.checked_add(1).unwrap_or(1))
    }
}

/// A commandline a process was launched with
///
/// Produced once per launch, never mutated. Carries the working
/// directory so any other window can execute it later.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandlineArgs {
    args: Vec<String>,
    cwd: PathBuf,
}

impl CommandlineArgs {
    pub fn new(args: Vec<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            args,
            cwd: cwd.into(),
        }
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }
}

impl fmt::Display for CommandlineArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.args.join(" "))
    }
}

/// Information about the last time a window was activated
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowActivatedArgs {
    pub peasant_id: PeasantId,
    /// Milliseconds since UNIX epoch
    pub activated_at_ms: u64,
}

#[test]
fn commandline_args_display() {
    let args = CommandlineArgs::new(vec!["new-tab".into(), "-p".into(), "cmd".into()], "/tmp");
    assert_eq!(args.to_string(), "new-tab -p cmd");
    assert_eq!(args.cwd(), Path::new("/tmp"));
}

#[test]
fn peasant_id_assignment() {
    assert!(!PeasantId::UNASSIGNED.is_assigned());
    assert!(PeasantId::UNASSIGNED.next().is_assigned());
    assert_eq!(PeasantId(41).next(), PeasantId(42));
    assert_eq!(PeasantId(u64::MAX).next(), PeasantId(1));
}
