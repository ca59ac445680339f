//! Scratch directory convergence.
//!
//! Drives a path to "exists, is a directory, is empty" and tolerates other
//! actors touching the same path at the same time. There is no locking:
//! when a removal or creation loses a race the whole convergence is retried
//! with a linearly growing delay until the attempt ceiling is reached.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Observed state of the target path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathState {
    Missing,
    EmptyDir,
    NonEmptyDir,
    /// Anything that is not a directory, including symlinks.
    NotADirectory,
}

/// What a single successful attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergeAction {
    AlreadyConverged,
    Created,
    EmptiedDirectory,
    ReplacedFile,
}

/// Filesystem operations used by the converger.
pub trait ConvergeFs {
    fn inspect(&self, path: &Path) -> io::Result<PathState>;
    fn remove_dir_all(&self, path: &Path) -> io::Result<()>;
    fn remove_file(&self, path: &Path) -> io::Result<()>;
    /// Create exactly `path`; must fail with `AlreadyExists` if it is present.
    fn create_dir(&self, path: &Path) -> io::Result<()>;
}

/// [`ConvergeFs`] over the real filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdFs;

impl ConvergeFs for StdFs {
    fn inspect(&self, path: &Path) -> io::Result<PathState> {
        let meta = match std::fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(PathState::Missing),
            Err(e) => return Err(e),
        };
        if !meta.is_dir() {
            return Ok(PathState::NotADirectory);
        }
        match std::fs::read_dir(path)?.next() {
            None => Ok(PathState::EmptyDir),
            Some(_) => Ok(PathState::NonEmptyDir),
        }
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_dir_all(path)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }

    fn create_dir(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::create_dir(path)
    }
}

/// Retry ceiling and backoff unit.
#[derive(Debug, Clone)]
pub struct ConvergePolicy {
    /// Maximum attempts including the first (minimum 1).
    pub max_attempts: u32,
    /// Delay after failed attempt `n` is `n * delay_unit`.
    pub delay_unit: Duration,
}

impl Default for ConvergePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            delay_unit: Duration::from_secs(1),
        }
    }
}

impl ConvergePolicy {
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.delay_unit.saturating_mul(attempt.max(1))
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

#[derive(Debug, Error)]
pub enum ConvergeError {
    #[error("could not converge {path} after {attempts} attempts: {last_error}")]
    Exhausted {
        path: PathBuf,
        attempts: u32,
        last_error: String,
    },
}

/// Failure of one attempt. Every variant is retried.
#[derive(Debug)]
enum AttemptError {
    /// Another actor removed or recreated the path under us.
    Raced(&'static str, io::Error),
    Unexpected(&'static str, io::Error),
}

impl AttemptError {
    fn removing(step: &'static str, e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::NotFound {
            Self::Raced(step, e)
        } else {
            Self::Unexpected(step, e)
        }
    }

    fn creating(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::AlreadyExists {
            Self::Raced("create", e)
        } else {
            Self::Unexpected("create", e)
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Raced(step, e) | Self::Unexpected(step, e) => format!("{step}: {e}"),
        }
    }
}

/// Converges a scratch directory to an empty state.
pub struct DirectoryConverger<F = StdFs> {
    fs: F,
    policy: ConvergePolicy,
}

impl DirectoryConverger<StdFs> {
    pub fn new(policy: ConvergePolicy) -> Self {
        Self { fs: StdFs, policy }
    }
}

impl<F: ConvergeFs> DirectoryConverger<F> {
    pub fn with_fs(fs: F, policy: ConvergePolicy) -> Self {
        Self { fs, policy }
    }

    /// Ensure `path` exists, is a directory, and is empty.
    pub async fn converge(&self, path: &Path) -> Result<PathBuf, ConvergeError> {
        let max_attempts = self.policy.max_attempts();
        let mut attempt = 1;

        loop {
            match self.converge_once(path) {
                Ok(action) => {
                    if action == ConvergeAction::AlreadyConverged {
                        debug!(path = %path.display(), attempt, "Scratch directory already converged");
                    } else {
                        info!(path = %path.display(), attempt, ?action, "Scratch directory converged");
                    }
                    return Ok(path.to_path_buf());
                }
                Err(err) => {
                    match &err {
                        AttemptError::Raced(step, e) => warn!(
                            path = %path.display(),
                            attempt,
                            step,
                            error = %e,
                            "Lost race converging scratch directory"
                        ),
                        AttemptError::Unexpected(step, e) => error!(
                            path = %path.display(),
                            attempt,
                            step,
                            error = %e,
                            "Unexpected error converging scratch directory"
                        ),
                    }
                    if attempt >= max_attempts {
                        error!(path = %path.display(), attempts = attempt, "Giving up on scratch directory");
                        return Err(ConvergeError::Exhausted {
                            path: path.to_path_buf(),
                            attempts: attempt,
                            last_error: err.describe(),
                        });
                    }
                    let delay = self.policy.backoff_delay(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "Retrying convergence");
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    fn converge_once(&self, path: &Path) -> Result<ConvergeAction, AttemptError> {
        let state = self
            .fs
            .inspect(path)
            .map_err(|e| AttemptError::Unexpected("inspect", e))?;

        let action = match state {
            PathState::EmptyDir => return Ok(ConvergeAction::AlreadyConverged),
            PathState::Missing => ConvergeAction::Created,
            PathState::NonEmptyDir => {
                self.fs
                    .remove_dir_all(path)
                    .map_err(|e| AttemptError::removing("remove_dir_all", e))?;
                ConvergeAction::EmptiedDirectory
            }
            PathState::NotADirectory => {
                self.fs
                    .remove_file(path)
                    .map_err(|e| AttemptError::removing("remove_file", e))?;
                ConvergeAction::ReplacedFile
            }
        };

        self.fs.create_dir(path).map_err(AttemptError::creating)?;
        Ok(action)
    }
}
