use std::{
    fmt,
    fs::File,
    io::{self, BufReader, Read},
    path::Path,
    str::FromStr,
};

use sha2::{Digest, Sha256};

use crate::{error::Error, Result};

/// Checksum algorithms recognized in repository metadata. Upstream manifests
/// only ever declare sha256 these days; adding an algorithm is one more case
/// here and in `checksum`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChecksumAlgo {
    #[default]
    Sha256,
}

impl ChecksumAlgo {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
        }
    }
}

impl fmt::Display for ChecksumAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChecksumAlgo {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sha256" => Ok(Self::Sha256),
            other => Err(Error::UnsupportedChecksum(other.to_string())),
        }
    }
}

/// Incremental hasher for chunked producers such as the downloader.
pub enum Hasher {
    Sha256(Sha256),
}

impl Hasher {
    pub fn new(algo: ChecksumAlgo) -> Self {
        match algo {
            ChecksumAlgo::Sha256 => Self::Sha256(Sha256::new()),
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        match self {
            Self::Sha256(inner) => inner.update(bytes),
        }
    }

    pub fn finalize_hex(self) -> String {
        match self {
            Self::Sha256(inner) => hex::encode(inner.finalize()),
        }
    }
}

/// Computes the hex-encoded checksum of a stream without buffering it whole.
pub fn checksum<R: Read>(algo: ChecksumAlgo, reader: &mut R) -> Result<String> {
    match algo {
        ChecksumAlgo::Sha256 => {
            let mut hasher = Sha256::new();
            io::copy(reader, &mut hasher)?;
            Ok(hex::encode(hasher.finalize()))
        }
    }
}

pub fn checksum_file<P: AsRef<Path>>(algo: ChecksumAlgo, path: P) -> Result<String> {
    let file = File::open(path.as_ref())?;
    checksum(algo, &mut BufReader::new(file))
}

/// Checksums the stream and compares against an expected hex digest. `label`
/// names the artifact in the resulting `ChecksumMismatch`.
pub fn validate<R: Read>(
    algo: ChecksumAlgo,
    reader: &mut R,
    expected: &str,
    label: &str,
) -> Result<()> {
    let actual = checksum(algo, reader)?;
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(Error::ChecksumMismatch(label.to_string()))
    }
}

pub fn validate_file<P: AsRef<Path>>(algo: ChecksumAlgo, path: P, expected: &str) -> Result<()> {
    let path = path.as_ref();
    let file = File::open(path)?;
    validate(
        algo,
        &mut BufReader::new(file),
        expected,
        &path.display().to_string(),
    )
}
