use std::path::PathBuf;
use std::time::Duration;

use typed_builder::TypedBuilder;
use windowd_api::ProcessId;

/// Some parameters of runtime operation
#[derive(TypedBuilder, Debug, Clone)]
pub struct Parameters {
    /// Our own pid, as compared with the leader's
    #[builder(default = ProcessId::current())]
    pub pid: ProcessId,

    /// Directory where the leader and peasant sockets live
    pub runtime_dir: PathBuf,

    /// Processes with the same `app_name` and `runtime_dir` elect one leader
    #[builder(default = Parameters::DEFAULT_APP_NAME.to_owned())]
    pub app_name: String,

    /// Display name of the window this process might create
    #[builder(default)]
    pub window_name: Option<String>,

    /// How often a follower checks if the leader process is still there
    #[builder(default = Parameters::DEFAULT_LIVENESS_POLL_PERIOD)]
    pub liveness_poll_period: Duration,

    /// Delay between attempts to reach or become the leader
    #[builder(default = Parameters::DEFAULT_CLAIM_RETRY_PERIOD)]
    pub claim_retry_period: Duration,

    /// Give up reaching or becoming the leader after this long
    #[builder(default = Parameters::DEFAULT_CLAIM_TIMEOUT)]
    pub claim_timeout: Duration,
}

impl Parameters {
    pub const DEFAULT_APP_NAME: &'static str = "windowd";
    pub const DEFAULT_LIVENESS_POLL_PERIOD: Duration = Duration::from_millis(100);
    pub const DEFAULT_CLAIM_RETRY_PERIOD: Duration = Duration::from_millis(10);
    pub const DEFAULT_CLAIM_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn monarch_socket_path(&self) -> PathBuf {
        self.runtime_dir
            .join(format!("{}-monarch.sock", self.app_name))
    }

    pub fn monarch_lock_path(&self) -> PathBuf {
        self.runtime_dir
            .join(format!("{}-monarch.lock", self.app_name))
    }

    pub fn peasant_socket_path(&self) -> PathBuf {
        self.runtime_dir
            .join(format!("{}-peasant-{}.sock", self.app_name, self.pid))
    }
}

#[test]
fn paths_are_namespaced_by_app_and_pid() {
    let params = Parameters::builder()
        .runtime_dir(PathBuf::from("/run/user/1000"))
        .pid(ProcessId(42))
        .build();

    assert_eq!(
        params.monarch_socket_path(),
        PathBuf::from("/run/user/1000/windowd-monarch.sock")
    );
    assert_eq!(
        params.monarch_lock_path(),
        PathBuf::from("/run/user/1000/windowd-monarch.lock")
    );
    assert_eq!(
        params.peasant_socket_path(),
        PathBuf::from("/run/user/1000/windowd-peasant-42.sock")
    );
}
