use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use futures_util::StreamExt;
use tokio::{
    io::AsyncWriteExt,
    sync::{mpsc, Semaphore},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    checksum::{ChecksumAlgo, Hasher},
    error::Error,
    Result,
};

pub const DEFAULT_PARALLEL: usize = 3;

const PROGRESS_INTERVAL: Duration = Duration::from_millis(200);

/// One file to fetch, with everything needed to verify it on arrival.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub dest: PathBuf,
    pub expected_size: u64,
    pub label: String,
    pub checksum: Option<(ChecksumAlgo, String)>,
}

#[derive(Debug, Clone)]
pub enum DownloadState {
    Preparing { total: u64 },
    Progress { current: u64, total: u64 },
    Complete,
    Failed,
}

pub type ProgressFn = Arc<dyn Fn(&str, DownloadState) + Send + Sync>;

#[derive(Debug)]
pub struct DownloadResult {
    pub request: DownloadRequest,
    pub bytes: u64,
    pub duration: Duration,
    pub error: Option<Error>,
}

impl DownloadResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Executes download requests with bounded parallelism. Completed transfers
/// are written to a temporary `.part` file and renamed over the destination
/// only after the declared checksum matches; failures and cancellation leave
/// no partial files behind.
pub struct Downloader {
    client: reqwest::Client,
    parallel: usize,
    cancel: CancellationToken,
    on_progress: Option<ProgressFn>,
}

impl Downloader {
    pub fn new(client: reqwest::Client, cancel: CancellationToken) -> Self {
        Self {
            client,
            parallel: DEFAULT_PARALLEL,
            cancel,
            on_progress: None,
        }
    }

    pub fn parallel(mut self, parallel: usize) -> Self {
        self.parallel = parallel.max(1);
        self
    }

    pub fn on_progress(mut self, on_progress: ProgressFn) -> Self {
        self.on_progress = Some(on_progress);
        self
    }

    /// Launches the request set. At most `parallel` transfers are in flight;
    /// results arrive on the returned channel in completion order. Once the
    /// cancellation token trips, queued requests fail fast with
    /// `Interrupted` while in-flight transfers stop and clean up.
    pub fn execute(&self, requests: Vec<DownloadRequest>) -> mpsc::Receiver<DownloadResult> {
        let (tx, rx) = mpsc::channel(self.parallel);
        let semaphore = Arc::new(Semaphore::new(self.parallel));

        for request in requests {
            let tx = tx.clone();
            let semaphore = semaphore.clone();
            let client = self.client.clone();
            let cancel = self.cancel.clone();
            let on_progress = self.on_progress.clone();

            tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };

                let started = Instant::now();
                let outcome = if cancel.is_cancelled() {
                    Err(Error::Interrupted)
                } else {
                    fetch_one(&client, &request, &cancel, on_progress.as_ref()).await
                };

                let result = match outcome {
                    Ok(bytes) => DownloadResult {
                        request,
                        bytes,
                        duration: started.elapsed(),
                        error: None,
                    },
                    Err(err) => DownloadResult {
                        request,
                        bytes: 0,
                        duration: started.elapsed(),
                        error: Some(err),
                    },
                };
                let _ = tx.send(result).await;
            });
        }

        rx
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}

/// Removes the in-progress temporary file unless the transfer completed.
struct PartGuard {
    path: PathBuf,
    keep: bool,
}

impl PartGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, keep: false }
    }
}

impl Drop for PartGuard {
    fn drop(&mut self) {
        if !self.keep {
            let _ = fs::remove_file(&self.path);
        }
    }
}

async fn fetch_one(
    client: &reqwest::Client,
    request: &DownloadRequest,
    cancel: &CancellationToken,
    on_progress: Option<&ProgressFn>,
) -> Result<u64> {
    let response = client.get(&request.url).send().await?;
    let status = response.status();
    if !status.is_success() {
        emit(on_progress, &request.label, DownloadState::Failed);
        return Err(Error::BadResponse {
            url: request.url.clone(),
            status: status.as_u16(),
        });
    }

    let total = response.content_length().unwrap_or(request.expected_size);
    emit(on_progress, &request.label, DownloadState::Preparing { total });

    if let Some(parent) = request.dest.parent() {
        fs::create_dir_all(parent)?;
    }

    let part = part_path(&request.dest);
    let mut guard = PartGuard::new(part.clone());

    let mut hasher = request.checksum.as_ref().map(|(algo, _)| Hasher::new(*algo));
    let written = Arc::new(AtomicU64::new(0));

    // the ticker emits progress at a fixed cadence so a slow consumer never
    // stalls the transfer itself
    let ticker = on_progress.map(|cb| {
        let cb = cb.clone();
        let label = request.label.clone();
        let written = written.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PROGRESS_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                cb(
                    &label,
                    DownloadState::Progress {
                        current: written.load(Ordering::Relaxed),
                        total,
                    },
                );
            }
        })
    });

    let transfer = async {
        let mut file = tokio::fs::File::create(&part).await?;
        let mut stream = response.bytes_stream();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Interrupted),
                chunk = stream.next() => match chunk {
                    None => break,
                    Some(chunk) => {
                        let chunk = chunk?;
                        if let Some(hasher) = hasher.as_mut() {
                            hasher.update(&chunk);
                        }
                        file.write_all(&chunk).await?;
                        written.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                    }
                },
            }
        }

        file.flush().await?;
        Ok(())
    }
    .await;

    if let Some(ticker) = ticker {
        ticker.abort();
    }

    if let Err(err) = transfer {
        emit(on_progress, &request.label, DownloadState::Failed);
        return Err(err);
    }

    if let (Some(hasher), Some((_, expected))) = (hasher, request.checksum.as_ref()) {
        let actual = hasher.finalize_hex();
        if !actual.eq_ignore_ascii_case(expected) {
            emit(on_progress, &request.label, DownloadState::Failed);
            return Err(Error::ChecksumMismatch(request.label.clone()));
        }
    }

    // rename over any pre-existing destination
    fs::rename(&part, &request.dest)?;
    guard.keep = true;

    let bytes = written.load(Ordering::Relaxed);
    debug!("downloaded {} ({} bytes)", request.label, bytes);
    emit(on_progress, &request.label, DownloadState::Complete);
    Ok(bytes)
}

fn emit(on_progress: Option<&ProgressFn>, label: &str, state: DownloadState) {
    if let Some(cb) = on_progress {
        cb(label, state);
    }
}
