//! In-process replicated store for tests.
//!
//! [`FakeReplicatedStore`] keeps its history in memory but operates on a real
//! working directory, so the ledger engine reads exactly what the store
//! wrote. Commits record the staged files, hard resets restore the tracked
//! files of the target revision, pushes follow a script and pulls apply
//! queued upstream changes as a new commit.

use crate::repo::{RepoError, ReplicatedStore, Revision};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};

type Tree = BTreeMap<PathBuf, Vec<u8>>;

/// What the next push does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
	Accept,
	/// The remote moved ahead
	Reject,
	/// Any other failure, e.g. the remote is unreachable
	Fail,
}

#[derive(Default)]
struct FakeState {
	commits: Vec<Tree>,
	head: usize,
	staged: BTreeSet<PathBuf>,
	push_script: VecDeque<PushOutcome>,
	upstream: VecDeque<(PathBuf, String)>,
	pull_failure: Option<String>,
	pushed: Option<usize>,
	calls: Vec<String>,
}

impl FakeState {
	fn revision(&self) -> Revision {
		Revision(format!("rev-{}", self.head))
	}
}

/// Replicated store fake backed by a real directory.
pub struct FakeReplicatedStore {
	workdir: PathBuf,
	state: Mutex<FakeState>,
}

impl FakeReplicatedStore {
	/// Track every file currently under `workdir` as the initial commit `rev-0`.
	pub fn new(workdir: impl Into<PathBuf>) -> std::io::Result<Self> {
		let workdir = workdir.into();
		let mut tree = Tree::new();
		read_tree(&workdir, &workdir, &mut tree)?;
		let state = FakeState {
			commits: vec![tree],
			..FakeState::default()
		};
		Ok(Self {
			workdir,
			state: Mutex::new(state),
		})
	}

	/// Queue outcomes for the next pushes; pushes beyond the script succeed.
	pub fn script_push(&self, outcomes: impl IntoIterator<Item = PushOutcome>) {
		self.state.lock().push_script.extend(outcomes);
	}

	/// Queue text another instance appended to `path`; the next pull brings it in.
	pub fn queue_upstream_append(&self, path: impl Into<PathBuf>, text: impl Into<String>) {
		self.state
			.lock()
			.upstream
			.push_back((path.into(), text.into()));
	}

	/// Make the next pull fail with an aborted merge.
	pub fn fail_next_pull(&self, message: impl Into<String>) {
		self.state.lock().pull_failure = Some(message.into());
	}

	/// Every call made so far, e.g. `"pull"`, `"stage ledger/x"`, `"reset rev-1"`.
	pub fn calls(&self) -> Vec<String> {
		self.state.lock().calls.clone()
	}

	pub fn clear_calls(&self) {
		self.state.lock().calls.clear();
	}

	/// Number of calls whose first word is `operation`.
	pub fn count(&self, operation: &str) -> usize {
		self.state
			.lock()
			.calls
			.iter()
			.filter(|call| call.split(' ').next() == Some(operation))
			.count()
	}

	pub fn head(&self) -> Revision {
		self.state.lock().revision()
	}

	/// Revision of the last accepted push.
	pub fn pushed(&self) -> Option<Revision> {
		self.state
			.lock()
			.pushed
			.map(|index| Revision(format!("rev-{}", index)))
	}

	/// Content of `path` in the HEAD commit.
	pub fn committed_file(&self, path: impl AsRef<Path>) -> Option<String> {
		let state = self.state.lock();
		state.commits[state.head]
			.get(path.as_ref())
			.map(|bytes| String::from_utf8_lossy(bytes).into_owned())
	}

	fn record(&self, call: String) {
		self.state.lock().calls.push(call);
	}
}

fn read_tree(root: &Path, dir: &Path, tree: &mut Tree) -> std::io::Result<()> {
	for entry in std::fs::read_dir(dir)? {
		let path = entry?.path();
		if path.is_dir() {
			read_tree(root, &path, tree)?;
		} else if let Ok(relative) = path.strip_prefix(root) {
			tree.insert(relative.to_path_buf(), std::fs::read(&path)?);
		}
	}
	Ok(())
}

fn write_file(root: &Path, relative: &Path, bytes: &[u8]) -> std::io::Result<()> {
	let path = root.join(relative);
	if let Some(parent) = path.parent() {
		std::fs::create_dir_all(parent)?;
	}
	std::fs::write(path, bytes)
}

#[async_trait]
impl ReplicatedStore for FakeReplicatedStore {
	fn workdir(&self) -> &Path {
		&self.workdir
	}

	async fn pull(&self) -> Result<(), RepoError> {
		let mut state = self.state.lock();
		state.calls.push("pull".to_string());
		if let Some(message) = state.pull_failure.take() {
			return Err(RepoError::MergeConflict(message));
		}
		if state.upstream.is_empty() {
			return Ok(());
		}

		let mut tree = state.commits[state.head].clone();
		let mut touched = BTreeSet::new();
		while let Some((path, text)) = state.upstream.pop_front() {
			tree.entry(path.clone())
				.or_default()
				.extend_from_slice(text.as_bytes());
			touched.insert(path);
		}
		for path in &touched {
			write_file(&self.workdir, path, &tree[path])?;
		}
		state.commits.push(tree);
		state.head = state.commits.len() - 1;
		Ok(())
	}

	async fn commit_all(&self, message: &str) -> Result<bool, RepoError> {
		let mut state = self.state.lock();
		state.calls.push(format!("commit {}", message));
		if state.staged.is_empty() {
			return Ok(false);
		}

		let mut tree = state.commits[state.head].clone();
		for path in std::mem::take(&mut state.staged) {
			match std::fs::read(self.workdir.join(&path)) {
				Ok(bytes) => {
					tree.insert(path, bytes);
				}
				Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
					tree.remove(&path);
				}
				Err(e) => return Err(e.into()),
			}
		}
		state.commits.push(tree);
		state.head = state.commits.len() - 1;
		Ok(true)
	}

	async fn push(&self) -> Result<(), RepoError> {
		let mut state = self.state.lock();
		state.calls.push("push".to_string());
		match state.push_script.pop_front().unwrap_or(PushOutcome::Accept) {
			PushOutcome::Accept => {
				state.pushed = Some(state.head);
				Ok(())
			}
			PushOutcome::Reject => Err(RepoError::PushRejected(
				" ! [rejected]        main -> main (fetch first)".to_string(),
			)),
			PushOutcome::Fail => Err(RepoError::CommandFailed {
				command: "git push".to_string(),
				stderr: "fatal: could not read from remote repository".to_string(),
			}),
		}
	}

	async fn reset_hard(&self, revision: &Revision) -> Result<(), RepoError> {
		let mut state = self.state.lock();
		state.calls.push(format!("reset {}", revision));
		let target = revision
			.as_str()
			.strip_prefix("rev-")
			.and_then(|index| index.parse::<usize>().ok())
			.filter(|index| *index < state.commits.len())
			.ok_or_else(|| RepoError::CommandFailed {
				command: format!("git reset --hard {}", revision),
				stderr: "unknown revision".to_string(),
			})?;

		let target_tree = state.commits[target].clone();
		let tracked: BTreeSet<PathBuf> = state.commits[state.head]
			.keys()
			.cloned()
			.chain(state.staged.iter().cloned())
			.collect();
		for path in tracked.iter().filter(|path| !target_tree.contains_key(*path)) {
			match std::fs::remove_file(self.workdir.join(path)) {
				Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
				_ => {}
			}
		}
		for (path, bytes) in &target_tree {
			write_file(&self.workdir, path, bytes)?;
		}
		state.head = target;
		state.staged.clear();
		Ok(())
	}

	async fn stage(&self, path: &Path) -> Result<(), RepoError> {
		let mut state = self.state.lock();
		state.calls.push(format!("stage {}", path.display()));
		state.staged.insert(path.to_path_buf());
		Ok(())
	}

	async fn rev_parse_head(&self) -> Result<Revision, RepoError> {
		self.record("rev-parse".to_string());
		Ok(self.state.lock().revision())
	}
}

/// Write `files` (relative path, content) under `dir`.
pub fn write_files(dir: &Path, files: &[(&str, &str)]) -> std::io::Result<()> {
	for (path, content) in files {
		write_file(dir, Path::new(path), content.as_bytes())?;
	}
	Ok(())
}
