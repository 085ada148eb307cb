use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    sync::LazyLock,
};

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::{checksum::ChecksumAlgo, error::Error, Result};

static SECTION_HEAD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\[(.*)\]").unwrap());
static KEY_VAL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\w+)\s*=\s*(.*)").unwrap());
static COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(^$)|(^\s+$)|(^#)|(^;)").unwrap());

/// One upstream repository described in a Yumfile section. Immutable for the
/// duration of a run once loading completes.
#[derive(Debug, Clone)]
pub struct RepoSpec {
    pub id: String,
    pub name: Option<String>,
    pub base_url: Option<String>,
    pub mirror_list_url: Option<String>,
    pub local_path: PathBuf,
    pub architecture: Option<String>,
    pub new_only: bool,
    pub include_sources: bool,
    pub delete_removed: bool,
    pub gpg_check: bool,
    pub gpg_key_location: Option<String>,
    pub checksum_algo: ChecksumAlgo,
    pub group_file: Option<PathBuf>,
    pub min_date: Option<DateTime<Utc>>,
    pub max_date: Option<DateTime<Utc>>,
    /// Yumfile line the section header appeared on.
    pub line: usize,
}

impl RepoSpec {
    fn new(id: String, line: usize) -> Self {
        Self {
            id,
            name: None,
            base_url: None,
            mirror_list_url: None,
            local_path: PathBuf::new(),
            architecture: None,
            new_only: false,
            include_sources: false,
            delete_removed: false,
            gpg_check: false,
            gpg_key_location: None,
            checksum_algo: ChecksumAlgo::default(),
            group_file: None,
            min_date: None,
            max_date: None,
            line,
        }
    }

    /// The upstream base URL. Mirror list resolution is not implemented, so a
    /// repo configured with only `mirrorlist` cannot be synced yet.
    pub fn base_url(&self) -> Result<&str> {
        self.base_url.as_deref().ok_or_else(|| {
            Error::ConfigInvalid(format!(
                "repo '{}' has no baseurl; mirror list resolution is not supported",
                self.id
            ))
        })
    }

    pub fn url_for(&self, href: &str) -> Result<String> {
        let base = self.base_url()?;
        Ok(format!(
            "{}/{}",
            base.trim_end_matches('/'),
            href.trim_start_matches('/')
        ))
    }
}

impl std::fmt::Display for RepoSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.id)
    }
}

/// The full parsed Yumfile: global settings plus one RepoSpec per section.
#[derive(Debug, Clone, Default)]
pub struct Yumfile {
    pub repos: Vec<RepoSpec>,
    pub path_prefix: Option<PathBuf>,
}

impl Yumfile {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|err| {
            Error::ConfigInvalid(format!("cannot read Yumfile {}: {err}", path.display()))
        })?;
        let mut yumfile = Self::parse(&content)?;
        yumfile.validate()?;
        Ok(yumfile)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut yumfile = Yumfile::default();
        let mut current: Option<RepoSpec> = None;

        for (idx, line) in content.lines().enumerate() {
            let n = idx + 1;

            if let Some(caps) = SECTION_HEAD.captures(line) {
                if let Some(repo) = current.take() {
                    yumfile.repos.push(repo);
                }
                current = Some(RepoSpec::new(caps[1].to_string(), n));
            } else if let Some(caps) = KEY_VAL.captures(line) {
                let key = &caps[1];
                let val = caps[2].trim();

                match current.as_mut() {
                    None => match key {
                        "pathprefix" => yumfile.path_prefix = Some(PathBuf::from(val)),
                        _ => return Err(syntax_error(n, &format!("unknown key: {key}"))),
                    },
                    Some(repo) => apply_key(repo, key, val, n)?,
                }
            } else if COMMENT.is_match(line) {
                // ignore
            } else {
                return Err(syntax_error(n, line));
            }
        }

        if let Some(repo) = current.take() {
            yumfile.repos.push(repo);
        }

        Ok(yumfile)
    }

    /// Ensures every section holds a usable repo definition and resolves each
    /// local path against the global prefix.
    pub fn validate(&mut self) -> Result<()> {
        let mut seen = HashSet::new();

        for repo in &mut self.repos {
            if repo.id.is_empty() {
                return Err(Error::ConfigInvalid(format!(
                    "repository on line {} has an empty id",
                    repo.line
                )));
            }
            if !seen.insert(repo.id.clone()) {
                return Err(Error::ConfigInvalid(format!(
                    "duplicate repository id '{}' (line {})",
                    repo.id, repo.line
                )));
            }
            if repo.base_url.is_none() && repo.mirror_list_url.is_none() {
                return Err(Error::ConfigInvalid(format!(
                    "repository '{}' has no mirror list or base URL (line {})",
                    repo.id, repo.line
                )));
            }

            if repo.local_path.as_os_str().is_empty() {
                repo.local_path = PathBuf::from(&repo.id);
            }
            if let Some(prefix) = &self.path_prefix {
                repo.local_path = prefix.join(&repo.local_path);
            }
        }

        Ok(())
    }

    pub fn repo(&self, id: &str) -> Option<&RepoSpec> {
        self.repos.iter().find(|repo| repo.id == id)
    }
}

fn apply_key(repo: &mut RepoSpec, key: &str, val: &str, n: usize) -> Result<()> {
    match key {
        "name" => repo.name = Some(val.to_string()),
        "baseurl" => repo.base_url = Some(val.to_string()),
        "mirrorlist" => repo.mirror_list_url = Some(val.to_string()),
        "localpath" => repo.local_path = PathBuf::from(val),
        "arch" => repo.architecture = Some(val.to_string()),
        "newonly" => repo.new_only = parse_bool(val, n)?,
        "sources" => repo.include_sources = parse_bool(val, n)?,
        "deleteremoved" => repo.delete_removed = parse_bool(val, n)?,
        "gpgcheck" => repo.gpg_check = parse_bool(val, n)?,
        "gpgkey" => repo.gpg_key_location = Some(val.to_string()),
        "checksum" => {
            repo.checksum_algo = val
                .parse()
                .map_err(|_| syntax_error(n, &format!("unsupported checksum type: {val}")))?
        }
        "groupfile" => repo.group_file = Some(PathBuf::from(val)),
        "mindate" => repo.min_date = Some(parse_date(val, n)?),
        "maxdate" => repo.max_date = Some(parse_date(val, n)?),
        _ => return Err(syntax_error(n, &format!("unknown key: {key}"))),
    }
    Ok(())
}

fn syntax_error(line: usize, msg: &str) -> Error {
    Error::ConfigInvalid(format!("Syntax error in Yumfile on line {line}: {msg}"))
}

fn parse_bool(val: &str, n: usize) -> Result<bool> {
    match val.to_lowercase().as_str() {
        "1" | "true" | "enabled" | "yes" => Ok(true),
        "0" | "false" | "disabled" | "no" => Ok(false),
        other => Err(syntax_error(n, &format!("invalid boolean value: {other}"))),
    }
}

/// Dates may be given as a unix epoch, RFC 3339, or RFC 2822 text.
fn parse_date(val: &str, n: usize) -> Result<DateTime<Utc>> {
    if let Ok(epoch) = val.parse::<i64>() {
        return DateTime::from_timestamp(epoch, 0)
            .ok_or_else(|| syntax_error(n, &format!("timestamp out of range: {val}")));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(val) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(val) {
        return Ok(dt.with_timezone(&Utc));
    }
    Err(syntax_error(n, &format!("invalid date: {val}")))
}
