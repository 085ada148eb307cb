use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::{checksum::ChecksumAlgo, compress::Format, error::Error, Result};

pub const XMLNS_REPO: &str = "http://linux.duke.edu/metadata/repo";
pub const XMLNS_RPM: &str = "http://linux.duke.edu/metadata/rpm";

/// `database_version` value for plain XML metadata files.
pub const DB_VERSION_XML: u32 = 0;
/// `database_version` value for bzip2-compressed SQLite databases.
pub const DB_VERSION_SQLITE: u32 = 10;

/// A parsed `repomd.xml` manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename = "repomd")]
pub struct RepoMd {
    #[serde(rename = "@xmlns", default = "xmlns_repo")]
    pub xmlns: String,
    #[serde(rename = "@xmlns:rpm", default = "xmlns_rpm")]
    pub xmlns_rpm: String,
    /// Publish generation; strictly increases at each upstream publish.
    pub revision: i64,
    #[serde(rename = "data", default)]
    pub data: Vec<RepoData>,
}

fn xmlns_repo() -> String {
    XMLNS_REPO.to_string()
}

fn xmlns_rpm() -> String {
    XMLNS_RPM.to_string()
}

/// One `<data>` entry: a database or metadata document of the repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoData {
    #[serde(rename = "@type")]
    pub db_type: String,
    pub checksum: Checksum,
    #[serde(rename = "open-checksum", skip_serializing_if = "Option::is_none")]
    pub open_checksum: Option<Checksum>,
    pub location: Location,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub size: u64,
    #[serde(rename = "open-size", skip_serializing_if = "Option::is_none")]
    pub open_size: Option<u64>,
    #[serde(rename = "database_version", default)]
    pub database_version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checksum {
    #[serde(rename = "@type")]
    pub algo: String,
    #[serde(rename = "$text")]
    pub value: String,
}

impl Checksum {
    pub fn new(algo: ChecksumAlgo, value: String) -> Self {
        Self {
            algo: algo.as_str().to_string(),
            value,
        }
    }

    pub fn algorithm(&self) -> Result<ChecksumAlgo> {
        self.algo.parse()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Location {
    #[serde(rename = "@href")]
    pub href: String,
}

impl RepoMd {
    pub fn new(revision: i64) -> Self {
        Self {
            xmlns: xmlns_repo(),
            xmlns_rpm: xmlns_rpm(),
            revision,
            data: Vec::new(),
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let repomd: RepoMd =
            quick_xml::de::from_reader(bytes).map_err(|err| Error::Metadata(err.to_string()))?;
        Ok(repomd)
    }

    pub fn parse_file(path: &Path) -> Result<Self> {
        Self::parse(&fs::read(path)?)
    }

    /// Checks the invariants a manifest must satisfy before the pipeline
    /// consumes it: every entry carries a recognized checksum, and every
    /// compressed entry also carries the open-checksum its decompressed form
    /// is validated against. Uncompressed entries (a plain comps.xml, say)
    /// legitimately have no open form.
    pub fn validate(&self) -> Result<()> {
        for db in &self.data {
            if db.checksum.value.is_empty() {
                return Err(Error::Metadata(format!(
                    "{} entry has an empty checksum",
                    db.db_type
                )));
            }
            db.checksum.algorithm()?;

            match &db.open_checksum {
                Some(open) if !open.value.is_empty() => {
                    open.algorithm()?;
                }
                _ if db.is_compressed() => {
                    return Err(Error::Metadata(format!(
                        "{} entry is missing its open-checksum",
                        db.db_type
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn to_xml(&self) -> Result<String> {
        let body =
            quick_xml::se::to_string(self).map_err(|err| Error::Metadata(err.to_string()))?;
        Ok(format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n{body}\n"
        ))
    }

    /// Serializes to `path` via a temporary file in the same directory so the
    /// previous manifest is replaced atomically or not at all.
    pub fn write_file(&self, path: &Path) -> Result<()> {
        let xml = self.to_xml()?;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));

        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(xml.as_bytes())?;
        tmp.flush()?;
        tmp.persist(path)
            .map_err(|err| Error::IoContext(format!("replacing {}", path.display()), err.error))?;
        Ok(())
    }
}

impl RepoData {
    /// Whether the referenced artifact needs decompression before use.
    pub fn is_compressed(&self) -> bool {
        Format::from_path(&self.location.href).is_some()
    }

    /// Base name of the artifact inside the cache directory.
    pub fn file_name(&self) -> &str {
        self.location
            .href
            .rsplit('/')
            .next()
            .unwrap_or(&self.location.href)
    }

    /// Path of the decompressed copy under the cache's `gen/` directory.
    /// `database_version` selects the suffix: 0 is an XML document, 10 is a
    /// bzip2-compressed SQLite database. Anything else is unsupported.
    pub fn decompressed_name(&self) -> Result<PathBuf> {
        match self.database_version {
            DB_VERSION_XML => Ok(PathBuf::from(format!("{}.xml", self.db_type))),
            DB_VERSION_SQLITE => Ok(PathBuf::from(format!("{}.sqlite", self.db_type))),
            other => Err(Error::Metadata(format!(
                "unsupported database version for {}: {}",
                self.db_type, other
            ))),
        }
    }
}
