//! Fetching flow YAML from git repositories.

use async_trait::async_trait;
use pipewright_core::job::Job;
use pipewright_core::task::YmlFetcher;
use pipewright_core::vars::keys;
use pipewright_core::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Prefix of the YAML file a flow repository carries at its root.
const YML_PREFIX: &str = ".pipewright";

/// Shallow-clones the flow's repository and reads its pipeline YAML.
///
/// The repository URL, branch and access token come from the job context
/// (`PIPEWRIGHT_GIT_URL`, `PIPEWRIGHT_GIT_BRANCH`, `PIPEWRIGHT_GIT_CREDENTIAL`).
pub struct GitYmlFetcher {
    /// Base directory for cloned repositories
    work_dir: PathBuf,
}

impl GitYmlFetcher {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }

    /// Local path a repository and branch are cloned into.
    pub fn repo_path(&self, clone_url: &str, branch: Option<&str>) -> PathBuf {
        let key = format!("{clone_url}#{}", branch.unwrap_or_default());
        self.work_dir.join(format!("{:x}", md5::compute(key)))
    }

    /// Clone `clone_url` at `branch`, replacing any earlier clone.
    pub async fn clone_repo(
        &self,
        clone_url: &str,
        branch: Option<&str>,
        access_token: Option<&str>,
    ) -> std::result::Result<PathBuf, GitError> {
        tokio::fs::create_dir_all(&self.work_dir).await?;

        let clone_path = self.repo_path(clone_url, branch);
        if clone_path.exists() {
            tokio::fs::remove_dir_all(&clone_path).await?;
        }
        let target = clone_path.to_str().ok_or(GitError::InvalidPath)?;

        // https://github.com/owner/repo.git -> https://token@github.com/owner/repo.git
        let auth_url = match (access_token, clone_url.strip_prefix("https://")) {
            (Some(token), Some(rest)) => format!("https://{token}@{rest}"),
            _ => clone_url.to_string(),
        };

        let mut args = vec!["clone", "--depth", "1", "--single-branch"];
        if let Some(branch) = branch {
            args.extend(["--branch", branch]);
        }
        args.extend([auth_url.as_str(), target]);

        info!(clone_url = %clone_url, branch = ?branch, path = %clone_path.display(), "Cloning repository");
        let output = Command::new("git")
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // Don't log the full error as it may contain the token
            warn!("Git clone failed");
            let message = match access_token {
                Some(token) if !token.is_empty() => stderr.replace(token, "[REDACTED]"),
                _ => stderr.into_owned(),
            };
            return Err(GitError::CloneFailed(message));
        }

        debug!(path = %clone_path.display(), "Repository cloned");
        Ok(clone_path)
    }
}

#[async_trait]
impl YmlFetcher for GitYmlFetcher {
    async fn fetch(&self, job: &Job) -> Result<String> {
        let url = job
            .context
            .non_empty(keys::GIT_URL)
            .ok_or_else(|| Error::NotAvailable(format!("{} is missing", keys::GIT_URL)))?;
        let branch = job.context.non_empty(keys::GIT_BRANCH);
        let token = job.context.non_empty(keys::GIT_CREDENTIAL);

        let repo = self.clone_repo(url, branch, token).await?;
        let path = find_yml(&repo).await?;
        info!(job_id = %job.id, file = %path.display(), "Loaded flow yaml");
        Ok(tokio::fs::read_to_string(&path).await.map_err(GitError::from)?)
    }
}

/// First `.pipewright*.yml` or `.pipewright*.yaml` at the repository root,
/// by file name.
async fn find_yml(repo: &Path) -> std::result::Result<PathBuf, GitError> {
    let mut entries = tokio::fs::read_dir(repo).await?;
    let mut candidates = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        let is_yml = name.ends_with(".yml") || name.ends_with(".yaml");
        if name.starts_with(YML_PREFIX) && is_yml && entry.file_type().await?.is_file() {
            candidates.push(entry.path());
        }
    }

    candidates.sort();
    candidates.into_iter().next().ok_or(GitError::NoYml)
}

/// Git operation errors.
#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Clone failed: {0}")]
    CloneFailed(String),

    #[error("Clone path is not valid UTF-8")]
    InvalidPath,

    #[error("No .pipewright*.yml file in repository")]
    NoYml,
}

impl From<GitError> for Error {
    fn from(e: GitError) -> Self {
        match e {
            GitError::NoYml => Error::NotFound(e.to_string()),
            GitError::CloneFailed(_) => Error::ExecutionFailed(e.to_string()),
            GitError::Io(_) | GitError::InvalidPath => Error::Internal(e.to_string()),
        }
    }
}
