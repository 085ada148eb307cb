use std::{
    fs,
    path::{Path, PathBuf},
};

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::{
    checksum, compress,
    config::RepoSpec,
    error::{Error, ErrorContext},
    primary_db::PrimaryDb,
    repomd::{RepoData, RepoMd},
    Result,
};

/// On-disk metadata cache shared by every configured repository. Each repo
/// gets its own subdirectory that persists across runs.
pub struct Cache {
    root: PathBuf,
}

impl Cache {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root)
            .with_context(|| format!("creating cache directory {}", root.display()))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn repo_cache(&self, repo: &RepoSpec, client: reqwest::Client) -> Result<RepoCache> {
        let path = self.root.join(&repo.id);
        fs::create_dir_all(path.join("gen"))
            .with_context(|| format!("creating cache directory {}", path.display()))?;

        Ok(RepoCache {
            path,
            base_url: repo.base_url()?.to_string(),
            client,
        })
    }
}

/// Cache directory for one upstream: the raw `repomd.xml`, each compressed
/// database it references, and decompressed copies under `gen/`.
pub struct RepoCache {
    path: PathBuf,
    base_url: String,
    client: reqwest::Client,
}

impl RepoCache {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Brings the cache up to date with the upstream and returns its
    /// validated manifest: fetch `repomd.xml`, compare revisions, then fetch
    /// and decompress whichever databases are missing or stale.
    pub async fn update(&self) -> Result<RepoMd> {
        let repomd = self.update_metadata().await?;

        for db in &repomd.data {
            self.fetch_database(db).await?;
            if db.is_compressed() {
                self.decompress_database(db)?;
            }
        }

        Ok(repomd)
    }

    async fn update_metadata(&self) -> Result<RepoMd> {
        let url = url_join(&self.base_url, "repodata/repomd.xml");
        debug!("Fetching repo metadata from {url}");

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::BadResponse {
                url,
                status: status.as_u16(),
            });
        }
        let bytes = response.bytes().await?;

        let repomd = RepoMd::parse(&bytes)?;
        repomd.validate()?;

        let cached_path = self.path.join("repomd.xml");
        let update = if cached_path.exists() {
            let cached = RepoMd::parse_file(&cached_path)?;
            if repomd.revision > cached.revision {
                debug!(
                    "Cached metadata revision {} requires an update to revision {}",
                    cached.revision, repomd.revision
                );
                true
            } else {
                debug!(
                    "Cached metadata already at upstream revision {}",
                    cached.revision
                );
                false
            }
        } else {
            true
        };

        if update {
            fs::write(&cached_path, &bytes)
                .with_context(|| format!("caching metadata to {}", cached_path.display()))?;
        }

        Ok(repomd)
    }

    /// Downloads one referenced database unless a cached copy already passes
    /// its compressed checksum. A checksum mismatch right after download is
    /// fatal for this upstream; a mismatch on an old cached copy just
    /// triggers the redownload.
    async fn fetch_database(&self, db: &RepoData) -> Result<PathBuf> {
        let dest = self.path.join(db.file_name());
        let algo = db.checksum.algorithm()?;

        if dest.exists() {
            match checksum::validate_file(algo, &dest, &db.checksum.value) {
                Ok(()) => {
                    debug!("Cached {} database is up to date", db.db_type);
                    return Ok(dest);
                }
                Err(Error::ChecksumMismatch(_)) => {
                    debug!("Cached {} database requires an update", db.db_type);
                }
                Err(err) => return Err(err),
            }
        }

        let url = url_join(&self.base_url, &db.location.href);
        info!("Fetching {} database from {url}", db.db_type);

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::BadResponse {
                url,
                status: status.as_u16(),
            });
        }

        let mut part_name = dest.file_name().unwrap_or_default().to_os_string();
        part_name.push(".part");
        let part = dest.with_file_name(part_name);
        let write_result: Result<()> = async {
            let mut file = tokio::fs::File::create(&part).await?;
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                file.write_all(&chunk?).await?;
            }
            file.flush().await?;
            Ok(())
        }
        .await;

        if let Err(err) = write_result {
            let _ = fs::remove_file(&part);
            return Err(err);
        }

        if let Err(err) = checksum::validate_file(algo, &part, &db.checksum.value) {
            let _ = fs::remove_file(&part);
            return Err(err);
        }
        fs::rename(&part, &dest)?;

        Ok(dest)
    }

    /// Expands a cached compressed database into `gen/`, validating the open
    /// checksum. The output file is deleted when validation fails.
    fn decompress_database(&self, db: &RepoData) -> Result<PathBuf> {
        let src = self.path.join(db.file_name());
        let dest = self.path.join("gen").join(db.decompressed_name()?);

        debug!("Decompressing {} database to {}", db.db_type, dest.display());
        compress::decompress_file(&src, &dest)?;

        let open = db
            .open_checksum
            .as_ref()
            .ok_or_else(|| Error::Metadata(format!("{} has no open-checksum", db.db_type)))?;
        if let Err(err) = checksum::validate_file(open.algorithm()?, &dest, &open.value) {
            let _ = fs::remove_file(&dest);
            return Err(err);
        }

        Ok(dest)
    }

    pub fn primary_db_path(&self) -> PathBuf {
        self.path.join("gen").join("primary_db.sqlite")
    }

    pub fn primary_db(&self) -> Result<PrimaryDb> {
        PrimaryDb::open(self.primary_db_path())
    }

    /// Drops all decompressed artifacts, e.g. after an interrupt.
    pub fn clean_gen(&self) -> Result<()> {
        let gen = self.path.join("gen");
        if gen.exists() {
            fs::remove_dir_all(&gen)
                .with_context(|| format!("removing directory {}", gen.display()))?;
        }
        fs::create_dir_all(&gen)?;
        Ok(())
    }
}

fn url_join(base: &str, href: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        href.trim_start_matches('/')
    )
}
