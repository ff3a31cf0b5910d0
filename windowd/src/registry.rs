//! Finding the leader, or becoming it
//!
//! The leader listens on a well-known socket. Claiming leadership means
//! taking an exclusive `flock` on a well-known lock file: first claimant
//! wins, and the OS releases the lock as soon as the claimant's process
//! is gone.
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};
use thiserror::Error;
use tracing::{debug, info, trace};

use crate::monarch::{LeaderHandle, Monarch, MonarchClient};
use crate::params::Parameters;
use crate::rpc::RpcServer;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("could not lock {}", path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },
    #[error("could not reach or become the leader within {0:?}")]
    Timeout(Duration),
    #[error("no leader to connect to, and not a leadership candidate")]
    NotACandidate,
}

pub type RegistryResult<T> = std::result::Result<T, RegistryError>;

/// Proof of registering as a leadership candidate, see [`LeaderRegistry::revoke`]
#[must_use]
#[derive(Debug)]
pub struct RegistrationToken {
    id: u64,
}

/// Monarch hosted by this process, with everything keeping it the leader
struct HostedMonarch {
    monarch: Arc<Monarch>,
    // note: server must go before the lock, so the socket is removed while we still own it
    #[allow(unused)]
    server: RpcServer,
    #[allow(unused)]
    lock: File,
}

pub struct LeaderRegistry {
    params: Parameters,
    next_token_id: AtomicU64,
    /// Id of the active [`RegistrationToken`], if any
    candidacy: Mutex<Option<u64>>,
    hosted: Mutex<Option<HostedMonarch>>,
}

impl LeaderRegistry {
    pub fn new(params: Parameters) -> RegistryResult<Self> {
        fs::create_dir_all(&params.runtime_dir)?;
        Ok(Self {
            params,
            next_token_id: AtomicU64::new(0),
            candidacy: Mutex::new(None),
            hosted: Mutex::new(None),
        })
    }

    /// Declare this process willing to become the leader
    pub fn register_candidate(&self) -> RegistrationToken {
        let id = self.next_token_id.fetch_add(1, Ordering::SeqCst);
        *self.candidacy.lock().expect("Locking failed") = Some(id);
        debug!(pid = %self.params.pid, "Registered as leadership candidate");
        RegistrationToken { id }
    }

    /// Withdraw the candidacy; from now on this process will never claim leadership
    ///
    /// Leadership already claimed is kept until [`LeaderRegistry::shutdown`].
    pub fn revoke(&self, token: RegistrationToken) {
        let mut candidacy = self.candidacy.lock().expect("Locking failed");
        if *candidacy == Some(token.id) {
            *candidacy = None;
            debug!(pid = %self.params.pid, "Revoked leadership candidacy");
        }
    }

    pub fn is_candidate(&self) -> bool {
        self.candidacy.lock().expect("Locking failed").is_some()
    }

    /// The monarch, if this process is the leader
    pub fn hosted_monarch(&self) -> Option<Arc<Monarch>> {
        self.hosted
            .lock()
            .expect("Locking failed")
            .as_ref()
            .map(|h| h.monarch.clone())
    }

    /// Get the current leader, becoming it if there is none
    pub fn connect_or_become_leader(&self) -> RegistryResult<LeaderHandle> {
        let socket_path = self.params.monarch_socket_path();
        let deadline = Instant::now() + self.params.claim_timeout;

        loop {
            {
                let mut hosted = self.hosted.lock().expect("Locking failed");

                if let Some(hosted) = hosted.as_ref() {
                    return Ok(LeaderHandle::Local(hosted.monarch.clone()));
                }

                match MonarchClient::connect(&socket_path) {
                    Ok(client) => {
                        debug!(path = %socket_path.display(), "Connected to the leader");
                        return Ok(LeaderHandle::Remote(Arc::new(client)));
                    }
                    Err(e) => {
                        trace!(error = %e, "No leader listening");
                    }
                }

                if self.is_candidate() {
                    if let Some(claimed) = self.try_claim()? {
                        let monarch = claimed.monarch.clone();
                        *hosted = Some(claimed);
                        return Ok(LeaderHandle::Local(monarch));
                    }
                }
            }

            if deadline <= Instant::now() {
                return Err(if self.is_candidate() {
                    RegistryError::Timeout(self.params.claim_timeout)
                } else {
                    RegistryError::NotACandidate
                });
            }
            thread::sleep(self.params.claim_retry_period);
        }
    }

    /// Stop serving as the leader, if we were
    pub fn shutdown(&self) {
        if self
            .hosted
            .lock()
            .expect("Locking failed")
            .take()
            .is_some()
        {
            info!(pid = %self.params.pid, "Stopped serving as the leader");
        }
    }

    /// Try to take the leader lock; `None` if someone else holds it
    fn try_claim(&self) -> RegistryResult<Option<HostedMonarch>> {
        let lock_path = self.params.monarch_lock_path();
        let lock = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&lock_path)?;

        match flock(lock.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => {}
            Err(Errno::EWOULDBLOCK) => {
                trace!("Leader lock taken, someone else is the leader or becoming it");
                return Ok(None);
            }
            Err(source) => {
                return Err(RegistryError::Lock {
                    path: lock_path,
                    source,
                })
            }
        }

        let socket_path = self.params.monarch_socket_path();
        // previous leader might have died without cleaning up
        match fs::remove_file(&socket_path) {
            Ok(()) => debug!(path = %socket_path.display(), "Removed stale leader socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let monarch = Arc::new(Monarch::new(self.params.pid));
        let server = monarch.serve(&socket_path)?;
        info!(pid = %self.params.pid, "Became the leader");

        Ok(Some(HostedMonarch {
            monarch,
            server,
            lock,
        }))
    }
}

impl Drop for LeaderRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}
