//!
//! Git working copy client.
//!
//! Every operation runs `git` as a child process inside the data directory
//! and waits for it to finish. Standard error is captured so failures can be
//! reported and, for pushes, classified.

use super::types::*;
use super::ReplicatedStore;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Replicated store backed by a git checkout.
#[derive(Debug, Clone)]
pub struct GitStore {
	/// Root of the checkout.
	workdir: PathBuf,
	/// Executable to invoke, `git` unless overridden.
	program: String,
}

impl GitStore {
	/// Create a client for the checkout at `workdir`.
	///
	/// # Arguments
	/// * `workdir` - Root directory of an existing git working copy.
	pub fn new(workdir: impl Into<PathBuf>) -> Self {
		Self {
			workdir: workdir.into(),
			program: "git".to_string(),
		}
	}

	/// Use a different git executable.
	pub fn with_program(mut self, program: impl Into<String>) -> Self {
		self.program = program.into();
		self
	}

	async fn run(&self, args: &[&str]) -> Result<Output, RepoError> {
		debug!("Running {} {}", self.program, args.join(" "));
		let output = Command::new(&self.program)
			.args(args)
			.current_dir(&self.workdir)
			.kill_on_drop(true)
			.output()
			.await?;
		Ok(output)
	}

	/// Run a command and turn a non-zero exit into `CommandFailed`.
	async fn run_checked(&self, args: &[&str]) -> Result<Output, RepoError> {
		let output = self.run(args).await?;
		if !output.status.success() {
			return Err(RepoError::CommandFailed {
				command: format!("{} {}", self.program, args.join(" ")),
				stderr: stderr_of(&output),
			});
		}
		Ok(output)
	}
}

fn stderr_of(output: &Output) -> String {
	String::from_utf8_lossy(&output.stderr).trim().to_string()
}

/// Decide whether a failed push was refused because the remote moved ahead.
///
/// # Arguments
/// * `stderr` - Standard error of the failed `git push`.
///
/// # Returns
/// `PushRejected` for non-fast-forward refusals, `CommandFailed` otherwise.
pub fn classify_push_failure(stderr: &str) -> RepoError {
	let lowered = stderr.to_lowercase();
	let rejected = ["non-fast-forward", "fetch first", "[rejected]"]
		.iter()
		.any(|marker| lowered.contains(marker));
	if rejected {
		RepoError::PushRejected(stderr.to_string())
	} else {
		RepoError::CommandFailed {
			command: "git push".to_string(),
			stderr: stderr.to_string(),
		}
	}
}

#[async_trait]
impl ReplicatedStore for GitStore {
	fn workdir(&self) -> &Path {
		&self.workdir
	}

	async fn pull(&self) -> Result<(), RepoError> {
		let output = self.run(&["pull", "--no-edit"]).await?;
		if output.status.success() {
			debug!("Pulled upstream changes");
			return Ok(());
		}

		let stderr = stderr_of(&output);
		warn!("Pull failed, aborting merge: {}", stderr);
		// Fails harmlessly when no merge is in progress.
		let abort = self.run(&["merge", "--abort"]).await?;
		if !abort.status.success() {
			debug!("merge --abort: {}", stderr_of(&abort));
		}
		Err(RepoError::MergeConflict(stderr))
	}

	async fn commit_all(&self, message: &str) -> Result<bool, RepoError> {
		let staged = self.run(&["diff", "--cached", "--quiet"]).await?;
		if staged.status.success() {
			debug!("Nothing staged, skipping commit");
			return Ok(false);
		}
		self.run_checked(&["commit", "--no-verify", "-m", message]).await?;
		Ok(true)
	}

	async fn push(&self) -> Result<(), RepoError> {
		let output = self.run(&["push"]).await?;
		if output.status.success() {
			info!("Pushed to remote");
			return Ok(());
		}
		Err(classify_push_failure(&stderr_of(&output)))
	}

	async fn reset_hard(&self, revision: &Revision) -> Result<(), RepoError> {
		info!("Resetting working copy to {}", revision);
		self.run_checked(&["reset", "--hard", revision.as_str()]).await?;
		Ok(())
	}

	async fn stage(&self, path: &Path) -> Result<(), RepoError> {
		let path = path.to_string_lossy();
		self.run_checked(&["add", "--", path.as_ref()]).await?;
		Ok(())
	}

	async fn rev_parse_head(&self) -> Result<Revision, RepoError> {
		let output = self.run_checked(&["rev-parse", "HEAD"]).await?;
		let revision = String::from_utf8_lossy(&output.stdout).trim().to_string();
		Ok(Revision(revision))
	}
}
