//! Per-process instance ledgers.
//!
//! Each running process appends to its own shard under the instance
//! directory. The shard is claimed lazily on the first write, named after the
//! host and the claim time, and registered by an `include` line in the shared
//! dynamic ledger file. Registration happens exactly once per process; after
//! that the shard is only ever reopened for append.

use crate::config::LedgerPaths;
use crate::error::LedgerError;
use crate::repo::ReplicatedStore;
use crate::sync::repositories::IncludeFile;
use crate::sync::retry::RetryPolicy;

use backoff::future::retry;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tracing::{debug, info};

/// Source of the current time, replaceable in tests.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

#[cfg(unix)]
fn system_hostname() -> Option<String> {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
}

#[cfg(not(unix))]
fn system_hostname() -> Option<String> {
    None
}

/// Host identity used in shard names.
pub fn hostname() -> String {
    system_hostname()
        .or_else(|| std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()))
        .unwrap_or_else(|| "localhost".to_string())
}

/// Lifecycle of this process's shard.
///
/// The name, relative to the working copy, never changes once assigned. The
/// open handle is dropped whenever the working copy may have changed under
/// it (pull, merge, reset) and reopened on the next [`acquire`].
///
/// [`acquire`]: InstanceLedger::acquire
#[derive(Debug, Default)]
pub enum InstanceLedger {
    #[default]
    Unallocated,
    /// Claimed and included in the shared ledger, no handle open
    Registered { name: PathBuf },
    Open { name: PathBuf, file: File },
    /// The handle was dropped because the file may have changed
    Stale { name: PathBuf },
}

impl InstanceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(&self) -> Option<&Path> {
        match self {
            InstanceLedger::Unallocated => None,
            InstanceLedger::Registered { name }
            | InstanceLedger::Open { name, .. }
            | InstanceLedger::Stale { name } => Some(name),
        }
    }

    pub fn is_registered(&self) -> bool {
        !matches!(self, InstanceLedger::Unallocated)
    }

    pub fn is_open(&self) -> bool {
        matches!(self, InstanceLedger::Open { .. })
    }

    /// Record the registered shard. The name of an allocated ledger is kept.
    pub fn register(&mut self, name: PathBuf) {
        if let Some(existing) = self.name() {
            debug!("Instance ledger already registered as {:?}", existing);
            return;
        }
        *self = InstanceLedger::Registered { name };
    }

    /// Open handle for appending, reopening the shard if needed.
    pub async fn acquire(&mut self, workdir: &Path) -> Result<&mut File, LedgerError> {
        let reopen = match self {
            InstanceLedger::Unallocated => {
                return Err(LedgerError::update_failed("Instance ledger is not allocated"));
            }
            InstanceLedger::Registered { name } | InstanceLedger::Stale { name } => {
                Some(name.clone())
            }
            InstanceLedger::Open { .. } => None,
        };
        if let Some(name) = reopen {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(workdir.join(&name))
                .await?;
            debug!("Opened instance ledger {:?}", name);
            *self = InstanceLedger::Open { name, file };
        }
        match self {
            InstanceLedger::Open { file, .. } => Ok(file),
            _ => Err(LedgerError::update_failed("Instance ledger is not open")),
        }
    }

    /// Close the handle, keeping the registration.
    pub fn release(&mut self) {
        match std::mem::take(self) {
            InstanceLedger::Open { name, .. } => *self = InstanceLedger::Registered { name },
            other => *self = other,
        }
    }

    /// Drop the handle because the file may have changed underneath it.
    pub fn mark_stale(&mut self) {
        match std::mem::take(self) {
            InstanceLedger::Unallocated => {}
            InstanceLedger::Registered { name }
            | InstanceLedger::Open { name, .. }
            | InstanceLedger::Stale { name } => *self = InstanceLedger::Stale { name },
        }
    }
}

/// Claims shard files and registers them in the shared ledger.
#[derive(Clone)]
pub struct InstanceLedgerAllocator {
    workdir: PathBuf,
    instance_dir: PathBuf,
    dynamic: PathBuf,
    host: String,
    clock: Clock,
    policy: RetryPolicy,
}

impl InstanceLedgerAllocator {
    pub fn new(workdir: impl Into<PathBuf>, paths: &LedgerPaths) -> Self {
        Self {
            workdir: workdir.into(),
            instance_dir: paths.instance_dir.clone(),
            dynamic: paths.dynamic.clone(),
            host: hostname(),
            clock: system_clock(),
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_hostname(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Shard file name for the current time.
    pub fn candidate_name(&self) -> String {
        format!(
            "{}_{}.beancount",
            self.host,
            (self.clock)().format("%Y%m%dT%H%M%S%.6fZ")
        )
    }

    /// Exclusively create a new shard file and return its path relative to
    /// the working copy.
    ///
    /// A name already taken by another process is retried with a fresh
    /// candidate after the allocation delay.
    pub async fn claim(&self) -> Result<PathBuf, LedgerError> {
        tokio::fs::create_dir_all(self.workdir.join(&self.instance_dir)).await?;

        retry(self.policy.allocation_backoff(), || async move {
            let relative = self.instance_dir.join(self.candidate_name());
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(self.workdir.join(&relative))
                .await
            {
                Ok(_) => {
                    info!("Claimed instance ledger {:?}", relative);
                    Ok(relative)
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let race = LedgerError::AllocationRace(relative.display().to_string());
                    debug!("{}, trying another name", race);
                    Err(backoff::Error::transient(race))
                }
                Err(e) => Err(backoff::Error::permanent(e.into())),
            }
        })
        .await
    }

    /// Target of the `include` line for `shard`, relative to the dynamic
    /// ledger file's directory.
    pub fn include_target(&self, shard: &Path) -> String {
        let base = self.dynamic.parent().unwrap_or_else(|| Path::new(""));
        match shard.strip_prefix(base) {
            Ok(relative) => relative.display().to_string(),
            Err(_) => self.workdir.join(shard).display().to_string(),
        }
    }

    /// Include `shard` in the dynamic ledger and stage both files.
    ///
    /// Meant to run inside a git-transaction scope. Running it again after a
    /// partial failure adds no second include line.
    pub async fn register(
        &self,
        repo: &dyn ReplicatedStore,
        shard: &Path,
    ) -> Result<(), LedgerError> {
        let dynamic = IncludeFile::new(self.workdir.join(&self.dynamic));
        let target = self.include_target(shard);
        if dynamic.contains(&target).await? {
            debug!("{:?} already includes {}", self.dynamic, target);
        } else {
            dynamic.append(&target).await?;
        }

        // A reset after a failed push removes the staged shard again
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.workdir.join(shard))
            .await?;

        repo.stage(shard).await?;
        repo.stage(&self.dynamic).await?;
        Ok(())
    }
}
