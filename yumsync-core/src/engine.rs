use std::{path::Path, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::{
    cache::Cache,
    config::Yumfile,
    download::{ProgressFn, DEFAULT_PARALLEL},
    error::Error,
    sync::{self, SyncOutcome},
    Result,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub const USER_AGENT: &str = concat!("yumsync/", env!("CARGO_PKG_VERSION"));

/// One run's worth of state: the loaded Yumfile, the metadata cache, a
/// shared HTTP client, and the cancellation token the signal handler trips.
/// Everything the pipeline needs travels through this handle.
pub struct Engine {
    yumfile: Yumfile,
    cache: Cache,
    client: reqwest::Client,
    cancel: CancellationToken,
    parallel: usize,
    on_progress: Option<ProgressFn>,
}

impl Engine {
    pub fn new<P: AsRef<Path>>(yumfile: Yumfile, cache_root: P) -> Result<Self> {
        // connect timeout only; transfers of large packages are unbounded
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            yumfile,
            cache: Cache::new(cache_root)?,
            client,
            cancel: CancellationToken::new(),
            parallel: DEFAULT_PARALLEL,
            on_progress: None,
        })
    }

    pub fn parallel(mut self, parallel: usize) -> Self {
        self.parallel = parallel.max(1);
        self
    }

    pub fn on_progress(mut self, on_progress: ProgressFn) -> Self {
        self.on_progress = Some(on_progress);
        self
    }

    /// A clone of the token that aborts the run; wire it to the interrupt
    /// handler at startup.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn yumfile(&self) -> &Yumfile {
        &self.yumfile
    }

    pub async fn sync_one(&self, id: &str) -> Result<SyncOutcome> {
        let repo = self.yumfile.repo(id).ok_or_else(|| {
            Error::ConfigInvalid(format!("No such repo found in Yumfile: {id}"))
        })?;

        sync::sync_repo(
            repo,
            &self.cache,
            &self.client,
            &self.cancel,
            self.parallel,
            self.on_progress.clone(),
        )
        .await
    }

    /// Processes every repository in Yumfile order. A failing upstream is
    /// logged and skipped so it cannot poison the others; interruption stops
    /// before the next upstream starts.
    pub async fn sync_all(&self) -> Result<()> {
        let mut failures = 0;

        for repo in &self.yumfile.repos {
            if self.cancel.is_cancelled() {
                return Err(Error::Interrupted);
            }

            let outcome = sync::sync_repo(
                repo,
                &self.cache,
                &self.client,
                &self.cancel,
                self.parallel,
                self.on_progress.clone(),
            )
            .await;

            match outcome {
                Ok(outcome) if outcome.failed > 0 => {
                    warn!(
                        "Repo {repo} finished with {} failed packages: {}",
                        outcome.failed,
                        outcome.failed_packages.join(", ")
                    );
                }
                Ok(_) => {}
                Err(Error::Interrupted) => return Err(Error::Interrupted),
                Err(err) => {
                    failures += 1;
                    error!("Failed to sync repo {repo}: {err}");
                }
            }
        }

        if failures > 0 && failures == self.yumfile.repos.len() {
            return Err(Error::Internal(format!(
                "all {failures} configured upstreams failed"
            )));
        }
        Ok(())
    }
}
