// not every test binary uses every helper
#![allow(dead_code)]

use std::{
    collections::HashMap,
    fs::File,
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
};

use yumsync_core::{
    checksum::{self, ChecksumAlgo},
    compress,
    primary_db::{PackageEntry, PrimaryDb},
    repomd::{Checksum, Location, RepoData, RepoMd, DB_VERSION_SQLITE},
    rpmfile,
};

/// A tiny single-purpose HTTP upstream serving an in-memory file map. Enough
/// of HTTP/1.1 for a GET-only client. Paths listed in `stall` send half
/// their body and then hold the connection open, for interrupt tests.
pub struct TestUpstream {
    pub url: String,
}

impl TestUpstream {
    pub async fn serve(files: HashMap<String, Vec<u8>>) -> Self {
        Self::serve_with_stall(files, Vec::new()).await
    }

    pub async fn serve_with_stall(files: HashMap<String, Vec<u8>>, stall: Vec<String>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let files = Arc::new(files);
        let stall = Arc::new(stall);

        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let files = files.clone();
                let stall = stall.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    let n = stream.read(&mut buf).await.unwrap_or(0);
                    let request = String::from_utf8_lossy(&buf[..n]).into_owned();
                    let path = request
                        .split_whitespace()
                        .nth(1)
                        .unwrap_or("/")
                        .to_string();

                    match files.get(&path) {
                        Some(body) if stall.contains(&path) => {
                            let header = format!(
                                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                                body.len()
                            );
                            let _ = stream.write_all(header.as_bytes()).await;
                            let _ = stream.write_all(&body[..body.len() / 2]).await;
                            let _ = stream.flush().await;
                            // never send the rest
                            tokio::time::sleep(std::time::Duration::from_secs(600)).await;
                        }
                        Some(body) => {
                            let mut response = format!(
                                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                                body.len()
                            )
                            .into_bytes();
                            response.extend_from_slice(body);
                            let _ = stream.write_all(&response).await;
                            let _ = stream.shutdown().await;
                        }
                        None => {
                            let _ = stream
                                .write_all(
                                    b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                                )
                                .await;
                            let _ = stream.shutdown().await;
                        }
                    }
                });
            }
        });

        Self {
            url: format!("http://{addr}"),
        }
    }
}

/// Builds a small real RPM on disk and returns its path.
pub fn build_rpm(dir: &Path, name: &str, version: &str, arch: &str) -> PathBuf {
    let package = rpm::PackageBuilder::new(name, version, "MIT", arch, "test package")
        .compression(rpm::CompressionType::Gzip)
        .build()
        .unwrap();

    let path = dir.join(format!("{name}-{version}-1.{arch}.rpm"));
    let mut file = File::create(&path).unwrap();
    package.write(&mut file).unwrap();
    path
}

/// Assembles the file map an upstream repository would serve for the given
/// RPMs: a primary_db built from their headers, bz2-compressed and
/// content-addressed, plus a matching repomd.xml. `tamper` can rewrite each
/// package's metadata before it lands in the index.
pub fn upstream_files(
    rpms: &[PathBuf],
    work: &Path,
    tamper: impl Fn(&mut rpmfile::PackageMeta),
) -> HashMap<String, Vec<u8>> {
    let algo = ChecksumAlgo::Sha256;

    let db_path = work.join("upstream-primary.sqlite");
    let db = PrimaryDb::create(&db_path).unwrap();
    db.begin().unwrap();
    for rpm in rpms {
        let mut meta = rpmfile::read_package(rpm, algo).unwrap();
        tamper(&mut meta);
        db.add_package(&meta).unwrap();
    }
    db.commit().unwrap();
    let db_path = db.finish().unwrap();

    let mut compressed = Vec::new();
    let mut reader = File::open(&db_path).unwrap();
    compress::bzip2_compress(&mut compressed, &mut reader).unwrap();

    let open_sum = checksum::checksum_file(algo, &db_path).unwrap();
    let open_size = std::fs::metadata(&db_path).unwrap().len();
    let sum = checksum::checksum(algo, &mut compressed.as_slice()).unwrap();

    let href = format!("repodata/{sum}-primary.sqlite.bz2");
    let mut repomd = RepoMd::new(42);
    repomd.data.push(RepoData {
        db_type: "primary_db".to_string(),
        checksum: Checksum::new(algo, sum),
        open_checksum: Some(Checksum::new(algo, open_sum)),
        location: Location { href: href.clone() },
        timestamp: 1,
        size: compressed.len() as u64,
        open_size: Some(open_size),
        database_version: DB_VERSION_SQLITE,
    });

    let mut files = HashMap::new();
    files.insert(
        "/repodata/repomd.xml".to_string(),
        repomd.to_xml().unwrap().into_bytes(),
    );
    files.insert(format!("/{href}"), compressed);
    for rpm in rpms {
        let name = rpm.file_name().unwrap().to_string_lossy().into_owned();
        files.insert(format!("/{name}"), std::fs::read(rpm).unwrap());
    }
    files
}

/// Opens the freshly published index under `local_path` and returns its rows.
pub fn read_published(local_path: &Path, work: &Path) -> Vec<PackageEntry> {
    let repomd = RepoMd::parse_file(&local_path.join("repodata/repomd.xml")).unwrap();
    repomd.validate().unwrap();

    let entry = repomd
        .data
        .iter()
        .find(|db| db.db_type == "primary_db")
        .expect("published manifest lists a primary_db");

    let compressed = local_path.join(&entry.location.href);
    checksum::validate_file(ChecksumAlgo::Sha256, &compressed, &entry.checksum.value).unwrap();

    let sqlite = work.join("published-primary.sqlite");
    compress::decompress_file(&compressed, &sqlite).unwrap();
    checksum::validate_file(
        ChecksumAlgo::Sha256,
        &sqlite,
        &entry.open_checksum.as_ref().unwrap().value,
    )
    .unwrap();

    PrimaryDb::open(&sqlite).unwrap().packages().unwrap()
}
