use error::Error;

pub mod cache;
pub mod checksum;
pub mod compress;
pub mod config;
pub mod download;
pub mod engine;
pub mod error;
pub mod gpg;
pub mod plan;
pub mod primary_db;
pub mod publish;
pub mod repomd;
pub mod rpmfile;
pub mod sync;
pub mod version;

pub type Result<T> = std::result::Result<T, Error>;
