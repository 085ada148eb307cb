use std::{fs, path::PathBuf, sync::Arc};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    cache::Cache,
    config::RepoSpec,
    download::{DownloadRequest, Downloader, ProgressFn},
    error::{Error, ErrorContext},
    gpg,
    plan::{self, Plan},
    publish,
    Result,
};

/// GPG verification is CPU-bound; it runs on its own small pool so a slow
/// check never stalls the downloader.
const GPG_VERIFY_PARALLEL: usize = 2;

/// Counters reported after one repository sync.
#[derive(Debug, Default)]
pub struct SyncOutcome {
    pub downloaded: usize,
    pub verified: usize,
    pub failed: usize,
    pub failed_packages: Vec<String>,
    pub revision: i64,
}

/// Runs the full pipeline for one upstream: refresh the metadata cache, plan
/// against the local package directory, fetch and verify what is missing,
/// then rebuild and publish the local index. Package-level failures are
/// counted and reported; they do not abort the run.
pub async fn sync_repo(
    repo: &RepoSpec,
    cache: &Cache,
    client: &reqwest::Client,
    cancel: &CancellationToken,
    parallel: usize,
    on_progress: Option<ProgressFn>,
) -> Result<SyncOutcome> {
    if cancel.is_cancelled() {
        return Err(Error::Interrupted);
    }

    info!("Synchronizing {repo} to {}", repo.local_path.display());

    let verifier = if repo.gpg_check {
        Some(Arc::new(gpg::open_keyring(repo.gpg_key_location.as_deref())?))
    } else {
        None
    };

    if let Some(group_file) = &repo.group_file {
        if !group_file.exists() {
            warn!(
                "Configured groupfile {} does not exist",
                group_file.display()
            );
        }
    }

    let repo_cache = cache.repo_cache(repo, client.clone())?;
    let repomd = repo_cache.update().await?;

    if cancel.is_cancelled() {
        repo_cache.clean_gen()?;
        return Err(Error::Interrupted);
    }

    fs::create_dir_all(&repo.local_path)
        .with_context(|| format!("creating local package path {}", repo.local_path.display()))?;

    let plan = if repomd.data.is_empty() {
        debug!("Upstream lists no databases; nothing to download");
        plan::plan(repo, Vec::new(), &repo.local_path)?
    } else if repomd.data.iter().any(|db| db.db_type == "primary_db") {
        let db = repo_cache.primary_db()?;
        let packages = db.packages()?;
        debug!("Loaded {} packages from primary_db", packages.len());
        plan::plan(repo, packages, &repo.local_path)?
    } else {
        return Err(Error::Metadata(format!(
            "upstream for {repo} lists no primary_db index"
        )));
    };

    for path in &plan.corrupt {
        warn!("Local file is corrupt and left in place: {}", path.display());
    }

    apply_delete_removed(repo, &plan);

    let mut outcome = SyncOutcome::default();
    if plan.missing.is_empty() {
        debug!("No packages scheduled for download");
    } else {
        info!(
            "Downloading {} new packages ({} bytes)",
            plan.missing.len(),
            plan.total_bytes
        );
        fetch_and_verify(
            repo,
            &plan,
            client,
            cancel,
            parallel,
            on_progress,
            verifier,
            &mut outcome,
        )
        .await?;
    }

    if cancel.is_cancelled() {
        repo_cache.clean_gen()?;
        return Err(Error::Interrupted);
    }

    let local_path = repo.local_path.clone();
    let algo = repo.checksum_algo;
    let publish_cancel = cancel.clone();
    let repomd = tokio::task::spawn_blocking(move || {
        publish::update_repo(&local_path, algo, &publish_cancel)
    })
    .await
    .map_err(|err| Error::Internal(format!("publish task failed: {err}")))??;
    outcome.revision = repomd.revision;

    info!(
        "Updated local database for {repo}: {} downloaded, {} verified, {} failed",
        outcome.downloaded, outcome.verified, outcome.failed
    );
    Ok(outcome)
}

/// The planner only reports local packages that disappeared upstream;
/// whether to delete them is this policy, keyed off `deleteremoved`.
fn apply_delete_removed(repo: &RepoSpec, plan: &Plan) {
    if plan.removed.is_empty() {
        return;
    }

    if repo.delete_removed {
        for path in &plan.removed {
            info!("Deleting local package no longer upstream: {}", path.display());
            if let Err(err) = fs::remove_file(path) {
                error!("Error deleting {}: {err}", path.display());
            }
        }
    } else {
        info!(
            "{} local packages are no longer upstream (deleteremoved is off)",
            plan.removed.len()
        );
    }
}

#[allow(clippy::too_many_arguments)]
async fn fetch_and_verify(
    repo: &RepoSpec,
    plan: &Plan,
    client: &reqwest::Client,
    cancel: &CancellationToken,
    parallel: usize,
    on_progress: Option<ProgressFn>,
    verifier: Option<Arc<rpm::signature::pgp::Verifier>>,
    outcome: &mut SyncOutcome,
) -> Result<()> {
    let total = plan.missing.len();
    let mut requests = Vec::with_capacity(total);

    for (i, package) in plan.missing.iter().enumerate() {
        let algo = match package.checksum_type.parse() {
            Ok(algo) => algo,
            Err(err) => {
                error!("Error reading checksum for package {package}: {err}");
                outcome.failed += 1;
                outcome.failed_packages.push(package.to_string());
                continue;
            }
        };

        requests.push(DownloadRequest {
            url: repo.url_for(&package.location_href)?,
            dest: repo.local_path.join(package.file_name()),
            expected_size: package.package_size,
            label: format!("[ {} / {} ] {package}", i + 1, total),
            checksum: Some((algo, package.pkg_id.clone())),
        });
    }

    let mut downloader = Downloader::new(client.clone(), cancel.clone()).parallel(parallel);
    if let Some(on_progress) = on_progress {
        downloader = downloader.on_progress(on_progress);
    }
    let mut results = downloader.execute(requests);

    let gpg_pool = Arc::new(Semaphore::new(GPG_VERIFY_PARALLEL));
    let mut checks: Vec<tokio::task::JoinHandle<(String, PathBuf, Result<()>)>> = Vec::new();

    while let Some(result) = results.recv().await {
        match result.error {
            Some(err) => {
                error!("Error downloading {}: {err}", result.request.label);
                outcome.failed += 1;
                outcome.failed_packages.push(result.request.label.clone());
            }
            None => {
                outcome.downloaded += 1;
                debug!(
                    "{} done in {:.1?} ({} bytes)",
                    result.request.label, result.duration, result.bytes
                );

                match &verifier {
                    None => outcome.verified += 1,
                    Some(verifier) => {
                        let permit = gpg_pool.clone().acquire_owned().await.unwrap();
                        let verifier = verifier.clone();
                        let path = result.request.dest.clone();
                        let label = result.request.label.clone();

                        checks.push(tokio::task::spawn_blocking(move || {
                            let verdict = gpg::verify_package(&path, &verifier);
                            drop(permit);
                            (label, path, verdict)
                        }));
                    }
                }
            }
        }
    }

    for check in checks {
        let (label, path, verdict) = check
            .await
            .map_err(|err| Error::Internal(format!("gpg worker failed: {err}")))?;
        match verdict {
            Ok(()) => outcome.verified += 1,
            Err(err) => {
                error!("GPG check validation failed for {label}: {err}");
                if let Err(err) = fs::remove_file(&path) {
                    error!("Error deleting {}: {err}", path.display());
                }
                outcome.failed += 1;
                outcome.failed_packages.push(label);
            }
        }
    }

    Ok(())
}
