use std::{
    fs::File,
    io::{self, BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
};

use bzip2::{read::BzDecoder, write::BzEncoder};
use flate2::read::GzDecoder;
use tempfile::NamedTempFile;
use xz2::read::XzDecoder;

use crate::{error::Error, Result};

/// Compression formats found in repository metadata, selected by filename
/// suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Bzip2,
    Xz,
    Gzip,
}

impl Format {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Option<Self> {
        match path.as_ref().extension().and_then(|ext| ext.to_str()) {
            Some("bz2") => Some(Self::Bzip2),
            Some("xz") => Some(Self::Xz),
            Some("gz") => Some(Self::Gzip),
            _ => None,
        }
    }
}

/// Wraps a reader in the streaming decompressor for `format`.
pub fn decompress_reader<'a, R: Read + 'a>(format: Format, reader: R) -> Box<dyn Read + 'a> {
    match format {
        Format::Bzip2 => Box::new(BzDecoder::new(reader)),
        Format::Xz => Box::new(XzDecoder::new(reader)),
        Format::Gzip => Box::new(GzDecoder::new(reader)),
    }
}

/// Streams `src` decompressed into `dest`, choosing the decoder from the
/// source filename. Returns the number of bytes written.
pub fn decompress_file(src: &Path, dest: &Path) -> Result<u64> {
    let format = Format::from_path(src).ok_or_else(|| {
        Error::Compression(format!("unsupported compression suffix: {}", src.display()))
    })?;

    let reader = BufReader::new(File::open(src)?);
    let mut reader = decompress_reader(format, reader);
    let mut writer = BufWriter::new(File::create(dest)?);

    let n = io::copy(&mut reader, &mut writer)?;
    writer.flush()?;
    Ok(n)
}

/// Compresses a stream with bzip2 at maximum compression. The encoder is
/// finished explicitly; dropping it early would leave a truncated or empty
/// output, and finish errors must surface to the caller.
pub fn bzip2_compress<W: Write, R: Read>(writer: W, reader: &mut R) -> Result<u64> {
    let mut encoder = BzEncoder::new(writer, bzip2::Compression::best());
    let n = io::copy(reader, &mut encoder)?;
    encoder.try_finish()?;
    Ok(n)
}

/// Compresses `src` into a temporary file created in `dir` and returns its
/// path. A zero-length source is rejected rather than published as an empty
/// database.
pub fn bzip2_compress_to_temp(src: &Path, dir: &Path) -> Result<PathBuf> {
    let mut reader = BufReader::new(File::open(src)?);
    let tmp = NamedTempFile::new_in(dir)?;

    let n = bzip2_compress(tmp.as_file(), &mut reader)?;
    if n == 0 {
        return Err(Error::Compression(format!(
            "source file is empty: {}",
            src.display()
        )));
    }

    let (_, path) = tmp
        .keep()
        .map_err(|err| Error::Compression(format!("persisting compressed file: {err}")))?;
    Ok(path)
}
