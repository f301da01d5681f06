//! Recording applied changes in version control
//!
//! After every successful Apply the server hands the product subtree and a
//! commit message to a [`ChangeRecorder`]. [`GitRecorder`] commits the
//! subtree with the system `git`; [`NoopRecorder`] does nothing.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info};

use confsync_core::config::GitConfig;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("failed to run git {args}: {source}")]
    Spawn {
        args: String,
        #[source]
        source: std::io::Error,
    },

    #[error("git {args} exited with status {status}: {stderr}")]
    Git {
        args: String,
        status: i32,
        stderr: String,
    },

    #[error("{} is not a git work tree", .0.display())]
    NotARepository(PathBuf),

    #[error("ssh key {} does not exist or is not readable", .0.display())]
    MissingSshKey(PathBuf),
}

/// Persists one applied change
#[async_trait]
pub trait ChangeRecorder: Send + Sync {
    /// Record the current contents of `subtree` (relative to the server root)
    async fn record_change(&self, subtree: &str, message: &str) -> Result<(), RecordError>;
}

/// Recorder used when versioning is disabled
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRecorder;

#[async_trait]
impl ChangeRecorder for NoopRecorder {
    async fn record_change(&self, subtree: &str, message: &str) -> Result<(), RecordError> {
        debug!("not recording {subtree}: {message}");
        Ok(())
    }
}

/// Commits each change to the git repository at the server root
#[derive(Debug)]
pub struct GitRecorder {
    root: PathBuf,
    user_name: String,
    user_email: String,
    /// `GIT_SSH_COMMAND` for reaching the remote with a configured key
    ssh_command: Option<String>,
    /// Serializes git invocations; concurrent products share one index
    lock: Mutex<()>,
}

impl GitRecorder {
    /// Attach to the work tree at `root`, then check out `config.branch`
    ///
    /// Without a work tree at `root`, `config.remote` is cloned into it, or
    /// failing that a fresh repository is initialized if `config.init` is on.
    ///
    /// # Errors
    /// Returns [`RecordError::NotARepository`] if there is no work tree and
    /// neither a remote nor `init` is configured,
    /// [`RecordError::MissingSshKey`] if `config.ssh_dir` has no key, or a
    /// git error if clone, init or checkout fails.
    pub async fn open(root: &Path, config: &GitConfig) -> Result<Self, RecordError> {
        let ssh_command = match &config.ssh_dir {
            Some(dir) => {
                let key = dir.join("id_rsa");
                if !key.is_file() {
                    return Err(RecordError::MissingSshKey(key));
                }
                debug!("using ssh key {}", key.display());
                Some(format!(
                    "ssh -i {} -o IdentitiesOnly=yes -o StrictHostKeyChecking=accept-new",
                    key.display()
                ))
            }
            None => None,
        };

        let recorder = Self {
            root: root.to_path_buf(),
            user_name: config.user_name.clone(),
            user_email: config.user_email.clone(),
            ssh_command,
            lock: Mutex::new(()),
        };

        let inside = recorder
            .git(&["rev-parse", "--is-inside-work-tree"])
            .await
            .is_ok_and(|out| out.trim() == "true");
        if !inside {
            recorder.bootstrap(config).await?;
        }

        if let Some(branch) = &config.branch {
            info!("checking out {branch} in {}", root.display());
            recorder.git(&["checkout", "--quiet", branch]).await?;
        }
        Ok(recorder)
    }

    async fn bootstrap(&self, config: &GitConfig) -> Result<(), RecordError> {
        if let Some(remote) = &config.remote {
            info!("{} is not a repository, cloning {remote}", self.root.display());
            tokio::fs::create_dir_all(&self.root)
                .await
                .map_err(|source| RecordError::Spawn {
                    args: "clone".to_string(),
                    source,
                })?;
            let mut args = vec!["clone", "--quiet"];
            if let Some(branch) = &config.branch {
                args.extend(["--branch", branch.as_str()]);
            }
            args.extend([remote.as_str(), "."]);
            return self.git(&args).await.map(drop);
        }

        if !config.init {
            return Err(RecordError::NotARepository(self.root.clone()));
        }
        info!("initializing git repository at {}", self.root.display());
        self.git(&["init", "--quiet"]).await.map(drop)
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn git(&self, args: &[&str]) -> Result<String, RecordError> {
        let mut command = Command::new("git");
        if let Some(ssh_command) = &self.ssh_command {
            command.env("GIT_SSH_COMMAND", ssh_command);
        }
        let output = command
            .arg("-C")
            .arg(&self.root)
            .args(["-c", &format!("user.name={}", self.user_name)])
            .args(["-c", &format!("user.email={}", self.user_email)])
            .args(["-c", "commit.gpgsign=false"])
            .args(args)
            .output()
            .await
            .map_err(|source| RecordError::Spawn {
                args: args.join(" "),
                source,
            })?;

        if !output.status.success() {
            return Err(RecordError::Git {
                args: args.join(" "),
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ChangeRecorder for GitRecorder {
    async fn record_change(&self, subtree: &str, message: &str) -> Result<(), RecordError> {
        let _guard = self.lock.lock().await;

        let status = self.git(&["status", "--porcelain", "--", subtree]).await?;
        if status.trim().is_empty() {
            debug!("nothing to record under {subtree}");
            return Ok(());
        }

        self.git(&["add", "-A", "--", subtree]).await?;
        self.git(&["commit", "--quiet", "-m", message, "--", subtree])
            .await?;
        info!("recorded: {message}");
        Ok(())
    }
}
