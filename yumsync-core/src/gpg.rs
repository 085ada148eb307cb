use std::{fs, path::Path};

use rpm::signature::pgp::Verifier;

use crate::{
    error::{Error, ErrorContext},
    Result,
};

/// Loads an ASCII-armoured keyring from a `file://` URL or plain path.
pub fn open_keyring(location: Option<&str>) -> Result<Verifier> {
    let location = location
        .ok_or_else(|| Error::ConfigInvalid("gpgcheck is enabled but gpgkey is not set".into()))?;

    let path = if location.to_lowercase().starts_with("file://") {
        &location[7..]
    } else {
        location
    };

    let bytes =
        fs::read(path).with_context(|| format!("reading GPG key {path}"))?;
    let verifier = Verifier::load_from_asc_bytes(&bytes)?;
    Ok(verifier)
}

/// Streams a downloaded package through signature verification against the
/// repository keyring. The caller decides what to do with the file on
/// failure.
pub fn verify_package(path: &Path, verifier: &Verifier) -> Result<()> {
    let package = rpm::Package::open(path)?;
    package
        .verify_signature(verifier)
        .map_err(|_| Error::SignatureInvalid(path.to_path_buf()))
}
