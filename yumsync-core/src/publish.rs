use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    sync::{mpsc, Mutex},
    thread,
    time::{SystemTime, UNIX_EPOCH},
};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    checksum::{self, ChecksumAlgo},
    compress,
    error::{Error, ErrorContext},
    primary_db::PrimaryDb,
    repomd::{Checksum, Location, RepoData, RepoMd, DB_VERSION_SQLITE},
    rpmfile::{self, PackageMeta},
    Result,
};

/// Rebuilds the primary index for the `*.rpm` files under `path` and swaps
/// in a fresh `repodata/repomd.xml`. Publish is all-or-nothing: any failure
/// removes the in-progress artifacts and leaves the previous manifest
/// untouched.
pub fn update_repo(path: &Path, algo: ChecksumAlgo, cancel: &CancellationToken) -> Result<RepoMd> {
    let repodata = path.join("repodata");
    let gen = repodata.join("gen");
    fs::create_dir_all(&gen)
        .with_context(|| format!("creating repodata directory {}", gen.display()))?;

    let result = build_and_publish(path, &repodata, &gen, algo, cancel);

    // gen/ only ever holds transient build artifacts
    if let Err(err) = fs::remove_dir_all(&gen) {
        debug!("Could not remove {}: {err}", gen.display());
    }

    result
}

fn build_and_publish(
    path: &Path,
    repodata: &Path,
    gen: &Path,
    algo: ChecksumAlgo,
    cancel: &CancellationToken,
) -> Result<RepoMd> {
    let mut files: Vec<PathBuf> = fs::read_dir(path)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "rpm"))
        .collect();
    files.sort();
    debug!("Found {} packages in {}", files.len(), path.display());

    // phase A: build
    let db_path = gen.join("primary_db.sqlite");
    let db = PrimaryDb::create(&db_path)?;
    db.begin()?;
    build_database(&db, &files, algo, cancel)?;
    db.commit()?;
    let db_path = db.finish()?;

    let open_size = fs::metadata(&db_path)?.len();
    let open_sum = checksum::checksum_file(algo, &db_path)?;
    let timestamp = fs::metadata(&db_path)?
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    // phase B: compress
    let tmp = compress::bzip2_compress_to_temp(&db_path, repodata)?;
    let compressed = (|| -> Result<(PathBuf, String)> {
        let sum = checksum::checksum_file(algo, &tmp)?;
        let name = format!("{sum}-primary.sqlite.bz2");
        let published = repodata.join(&name);
        fs::rename(&tmp, &published)?;
        Ok((published, sum))
    })();
    let (published, sum) = match compressed {
        Ok(ok) => ok,
        Err(err) => {
            let _ = fs::remove_file(&tmp);
            return Err(err);
        }
    };

    // phase C: publish
    let size = fs::metadata(&published)?.len();
    let entry = RepoData {
        db_type: "primary_db".to_string(),
        checksum: Checksum::new(algo, sum),
        open_checksum: Some(Checksum::new(algo, open_sum)),
        location: Location {
            href: format!("repodata/{}", published.file_name().unwrap().to_string_lossy()),
        },
        timestamp,
        size,
        open_size: Some(open_size),
        database_version: DB_VERSION_SQLITE,
    };

    let repomd_path = repodata.join("repomd.xml");
    let mut repomd = RepoMd::new(next_revision(&repomd_path));
    repomd.data.push(entry);

    if let Err(err) = repomd.write_file(&repomd_path) {
        let _ = fs::remove_file(&published);
        return Err(err);
    }

    prune_stale_databases(repodata, &repomd);

    info!(
        "Published {} packages to {} (revision {})",
        files.len(),
        path.display(),
        repomd.revision
    );
    Ok(repomd)
}

/// Feeds parsed packages from a single producer through an unbuffered
/// channel into a pool of insert workers sized to the CPU count. All inserts
/// land in the one transaction opened by the caller.
fn build_database(
    db: &PrimaryDb,
    files: &[PathBuf],
    algo: ChecksumAlgo,
    cancel: &CancellationToken,
) -> Result<()> {
    let worker_count = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    let (tx, rx) = mpsc::sync_channel::<PackageMeta>(0);
    let rx = Mutex::new(rx);
    let failure: Mutex<Option<Error>> = Mutex::new(None);

    debug!("Starting {worker_count} insert workers");
    thread::scope(|scope| -> Result<()> {
        for worker in 1..=worker_count {
            let rx = &rx;
            let failure = &failure;
            scope.spawn(move || loop {
                let package = rx.lock().unwrap().recv();
                let Ok(package) = package else { break };

                debug!("[worker {worker}] added {}", package.location_href);
                if let Err(err) = db.add_package(&package) {
                    error!(
                        "[worker {worker}] error adding package {}: {err}",
                        package.location_href
                    );
                    failure.lock().unwrap().get_or_insert(err);
                }
            });
        }

        for file in files {
            if cancel.is_cancelled() {
                return Err(Error::Interrupted);
            }
            let package = rpmfile::read_package(file, algo)?;
            if tx.send(package).is_err() {
                break;
            }
        }
        drop(tx);
        Ok(())
    })?;

    if let Some(err) = failure.into_inner().unwrap() {
        return Err(err);
    }
    Ok(())
}

/// New manifests stamp the current unix time, but the revision must strictly
/// increase even across rapid republishes.
fn next_revision(repomd_path: &Path) -> i64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    match RepoMd::parse_file(repomd_path) {
        Ok(previous) => now.max(previous.revision + 1),
        Err(_) => now,
    }
}

/// Content-addressed databases from earlier publishes are unreferenced once
/// the new manifest lands.
fn prune_stale_databases(repodata: &Path, repomd: &RepoMd) {
    let referenced: HashSet<&str> = repomd.data.iter().map(|db| db.file_name()).collect();

    let Ok(entries) = fs::read_dir(repodata) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.ends_with(".sqlite.bz2") && !referenced.contains(name.as_ref()) {
            debug!("Removing stale database {name}");
            let _ = fs::remove_file(entry.path());
        }
    }
}
