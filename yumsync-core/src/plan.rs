use std::{
    collections::{HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
};

use tracing::{debug, warn};

use crate::{
    checksum::{self, ChecksumAlgo},
    config::RepoSpec,
    error::Error,
    primary_db::PackageEntry,
    Result,
};

/// The planner's verdict for one upstream: what to download, how much that
/// is, and what it found wrong locally. Corrupt and removed files are only
/// reported here; acting on them is a policy decision made later.
#[derive(Debug, Default)]
pub struct Plan {
    pub missing: Vec<PackageEntry>,
    pub total_bytes: u64,
    pub corrupt: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
}

/// Applies the repository's filter rules, in order: newest-only per
/// (name, arch), exact architecture, build-date window, and source-RPM
/// exclusion.
pub fn filter_packages(repo: &RepoSpec, packages: Vec<PackageEntry>) -> Vec<PackageEntry> {
    let mut packages = packages;

    if repo.new_only {
        let mut order: Vec<(String, String)> = Vec::new();
        let mut newest: HashMap<(String, String), PackageEntry> = HashMap::new();

        for package in packages {
            let key = (package.name.clone(), package.arch.clone());
            match newest.get(&key) {
                // strictly newer replaces; a tie keeps the earlier entry
                Some(current) if package.evr() > current.evr() => {
                    newest.insert(key, package);
                }
                Some(_) => {}
                None => {
                    order.push(key.clone());
                    newest.insert(key, package);
                }
            }
        }

        packages = order
            .into_iter()
            .filter_map(|key| newest.remove(&key))
            .collect();
    }

    packages.retain(|package| {
        if let Some(arch) = &repo.architecture {
            if package.arch != *arch {
                return false;
            }
        }
        if !repo.include_sources && package.arch == "src" {
            return false;
        }
        if let Some(min) = repo.min_date {
            if package.build_time < min.timestamp() {
                return false;
            }
        }
        if let Some(max) = repo.max_date {
            if package.build_time > max.timestamp() {
                return false;
            }
        }
        true
    });

    packages
}

enum FileVerdict {
    Current,
    Missing,
    Corrupt,
}

/// Filters the upstream package list and reconciles it against the local
/// package directory. A local file is current only when its size matches
/// exactly and its content passes the declared checksum.
pub fn plan(repo: &RepoSpec, packages: Vec<PackageEntry>, package_dir: &Path) -> Result<Plan> {
    let filtered = filter_packages(repo, packages);
    debug!("Found {} packages after filtering", filtered.len());

    let mut local: HashMap<String, u64> = HashMap::new();
    if package_dir.exists() {
        for entry in fs::read_dir(package_dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if name.ends_with(".rpm") {
                    local.insert(name.to_string(), meta.len());
                }
            }
        }
    }

    let mut plan = Plan::default();
    let mut expected = HashSet::new();

    for package in filtered {
        let file_name = package.file_name().to_string();
        let path = package_dir.join(&file_name);
        expected.insert(file_name.clone());

        let verdict = match local.get(&file_name) {
            None => FileVerdict::Missing,
            Some(&size) if size == package.package_size => {
                verify_local_file(&package, &path)
            }
            Some(&size) if size > package.package_size => {
                warn!(
                    "Existing file is larger ({size} bytes) than expected ({}) for package {package}",
                    package.package_size
                );
                FileVerdict::Corrupt
            }
            Some(_) => {
                debug!("Existing file is incomplete for package {package}");
                FileVerdict::Missing
            }
        };

        match verdict {
            FileVerdict::Current => {}
            FileVerdict::Corrupt => plan.corrupt.push(path),
            FileVerdict::Missing => {
                plan.total_bytes += package.package_size;
                plan.missing.push(package);
            }
        }
    }

    plan.removed = local
        .keys()
        .filter(|name| !expected.contains(*name))
        .map(|name| package_dir.join(name))
        .collect();
    plan.removed.sort();

    Ok(plan)
}

fn verify_local_file(package: &PackageEntry, path: &Path) -> FileVerdict {
    let algo = match package.checksum_type.parse::<ChecksumAlgo>() {
        Ok(algo) => algo,
        Err(_) => {
            warn!(
                "Unsupported checksum type '{}' for package {package}, scheduling re-download",
                package.checksum_type
            );
            return FileVerdict::Missing;
        }
    };

    match checksum::validate_file(algo, path, &package.pkg_id) {
        Ok(()) => FileVerdict::Current,
        Err(Error::ChecksumMismatch(_)) => {
            warn!("Existing file failed checksum validation for package {package}");
            FileVerdict::Missing
        }
        Err(err) => {
            warn!("Error validating checksum for package {package}: {err}");
            FileVerdict::Missing
        }
    }
}
