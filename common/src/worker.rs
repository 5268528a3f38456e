// Worker process launching
//
// One external process per run. Its stdout/stderr go to two artifact files
// named by job id and run timestamp; the engine only observes the exit code.

use crate::config::WorkerConfig;
use crate::errors::WorkerError;
use crate::models::{Environment, ExecutionParams, Job, JobId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

/// Everything the worker needs for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRequest {
    pub job_id: JobId,
    pub job_name: String,
    pub started_at: DateTime<Utc>,
    pub source_environment: Environment,
    pub target_environment: Environment,
    pub source_credentials: Option<String>,
    pub target_credentials: Option<String>,
    pub params: ExecutionParams,
}

impl WorkerRequest {
    pub fn for_job(job: &Job, started_at: DateTime<Utc>) -> Self {
        Self {
            job_id: job.id,
            job_name: job.name.clone(),
            started_at,
            source_environment: job.source_environment,
            target_environment: job.target_environment,
            source_credentials: job.source_credentials.clone(),
            target_credentials: job.target_credentials.clone(),
            params: job.params.clone(),
        }
    }

    /// Named arguments in the order the worker expects them
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "--job-id".to_string(),
            self.job_id.to_string(),
            "--source".to_string(),
            self.source_environment.to_string(),
            "--target".to_string(),
            self.target_environment.to_string(),
            "--batch-size".to_string(),
            self.params.batch_size.to_string(),
        ];

        if let Some(credentials) = &self.source_credentials {
            args.push("--source-credentials".to_string());
            args.push(credentials.clone());
        }
        if let Some(credentials) = &self.target_credentials {
            args.push("--target-credentials".to_string());
            args.push(credentials.clone());
        }
        if !self.params.collections.is_empty() {
            args.push("--collections".to_string());
            args.push(self.params.collections.join(","));
        }
        if let Some(query) = &self.params.query {
            args.push("--query".to_string());
            args.push(query.clone());
        }
        if self.params.include_indexes {
            args.push("--include-indexes".to_string());
        }
        if self.params.transform {
            args.push("--transform".to_string());
        }
        if self.params.backup {
            args.push("--backup".to_string());
        }

        args
    }
}

/// Paths of the captured output of one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunArtifacts {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

impl RunArtifacts {
    /// `<dir>/<job id>-<YYYYMMDDTHHMMSS.ffffffZ>.{stdout,stderr}.log`
    pub fn for_run(dir: &Path, job_id: JobId, started_at: DateTime<Utc>) -> Self {
        let stem = format!("{}-{}", job_id, started_at.format("%Y%m%dT%H%M%S%.6fZ"));
        Self {
            stdout: dir.join(format!("{stem}.stdout.log")),
            stderr: dir.join(format!("{stem}.stderr.log")),
        }
    }
}

/// A launched worker; `exit` resolves with the process exit code
pub struct RunningWorker {
    pub artifacts: RunArtifacts,
    pub exit: BoxFuture<'static, Result<i32, WorkerError>>,
}

impl std::fmt::Debug for RunningWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningWorker")
            .field("artifacts", &self.artifacts)
            .finish_non_exhaustive()
    }
}

/// WorkerLauncher starts the external migration process for one run
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, request: &WorkerRequest) -> Result<RunningWorker, WorkerError>;
}

/// Launches the configured program as a child process
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: String,
    base_args: Vec<String>,
    working_dir: Option<PathBuf>,
    log_dir: PathBuf,
}

impl ProcessLauncher {
    pub fn new(config: &WorkerConfig, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: config.program.clone(),
            base_args: config.args.clone(),
            working_dir: config.working_dir.as_ref().map(PathBuf::from),
            log_dir: log_dir.into(),
        }
    }

    /// Never truncates: an existing file belongs to another run
    fn open_artifact(path: &Path) -> Result<std::fs::File, WorkerError> {
        std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| WorkerError::ArtifactFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    #[tracing::instrument(skip(self, request), fields(job_id = %request.job_id, job_name = %request.job_name))]
    async fn launch(&self, request: &WorkerRequest) -> Result<RunningWorker, WorkerError> {
        tokio::fs::create_dir_all(&self.log_dir)
            .await
            .map_err(|e| WorkerError::ArtifactFailed {
                path: self.log_dir.display().to_string(),
                reason: e.to_string(),
            })?;

        let artifacts = RunArtifacts::for_run(&self.log_dir, request.job_id, request.started_at);
        let stdout = Self::open_artifact(&artifacts.stdout)?;
        let stderr = Self::open_artifact(&artifacts.stderr)?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.base_args)
            .args(request.to_args())
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(false);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| WorkerError::SpawnFailed {
            program: self.program.clone(),
            reason: e.to_string(),
        })?;

        info!(pid = child.id(), stdout = %artifacts.stdout.display(), "Worker process spawned");

        let exit = async move {
            let status = child
                .wait()
                .await
                .map_err(|e| WorkerError::WaitFailed(e.to_string()))?;
            debug!(?status, "Worker process exited");
            // Killed by a signal: no exit code
            Ok(status.code().unwrap_or(-1))
        }
        .boxed();

        Ok(RunningWorker { artifacts, exit })
    }
}
