#![deny(clippy::as_conversions)]

mod event;
mod liveness;
mod monarch;
mod params;
mod peasant;
mod registry;
pub mod routing;
mod rpc;
mod task;
mod window_manager;

pub use event::{Event, EventToken};
pub use liveness::{Interrupt, PidWaiter, ProcessWaiter, WaitError, WaitOutcome};
pub use monarch::{FindTargetWindowArgs, LeaderHandle, Monarch, MonarchClient, WindowTarget};
pub use params::Parameters;
pub use peasant::{Peasant, PeasantClient, PeasantHandle, WindowExecutor};
pub use registry::{LeaderRegistry, RegistrationToken, RegistryError, RegistryResult};
pub use rpc::{RpcError, RpcResult};
pub use task::AutoJoinHandle;
pub use window_manager::{
    ManagerState, Role, WindowManager, WindowManagerError, WindowManagerResult,
};
