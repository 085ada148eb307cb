use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use rusqlite::{params, Connection, OpenFlags};

use crate::{error::Error, rpmfile::PackageMeta, version::Evr, Result};

const SQL_CREATE_TABLES: &str = "\
CREATE TABLE db_info (dbversion INTEGER, checksum TEXT);
CREATE TABLE packages ( pkgKey INTEGER PRIMARY KEY, pkgId TEXT, name TEXT, arch TEXT, version TEXT, epoch TEXT, release TEXT, summary TEXT, description TEXT, url TEXT, time_file INTEGER, time_build INTEGER, rpm_license TEXT, rpm_vendor TEXT, rpm_group TEXT, rpm_buildhost TEXT, rpm_sourcerpm TEXT, rpm_header_start INTEGER, rpm_header_end INTEGER, rpm_packager TEXT, size_package INTEGER, size_installed INTEGER, size_archive INTEGER, location_href TEXT, location_base TEXT, checksum_type TEXT);
CREATE TABLE files ( name TEXT, type TEXT, pkgKey INTEGER);
CREATE TABLE requires ( name TEXT, flags TEXT, epoch TEXT, version TEXT, release TEXT, pkgKey INTEGER , pre BOOLEAN DEFAULT FALSE);
CREATE TABLE provides ( name TEXT, flags TEXT, epoch TEXT, version TEXT, release TEXT, pkgKey INTEGER );
CREATE TABLE conflicts ( name TEXT, flags TEXT, epoch TEXT, version TEXT, release TEXT, pkgKey INTEGER );
CREATE TABLE obsoletes ( name TEXT, flags TEXT, epoch TEXT, version TEXT, release TEXT, pkgKey INTEGER );";

const SQL_CREATE_INDEXES: &str = "\
CREATE INDEX packagename ON packages (name);
CREATE INDEX packageId ON packages (pkgId);
CREATE INDEX filenames ON files (name);
CREATE INDEX pkgfiles ON files (pkgKey);
CREATE INDEX pkgrequires on requires (pkgKey);
CREATE INDEX requiresname ON requires (name);
CREATE INDEX pkgprovides on provides (pkgKey);
CREATE INDEX providesname ON provides (name);
CREATE INDEX pkgconflicts on conflicts (pkgKey);
CREATE INDEX pkgobsoletes on obsoletes (pkgKey);";

const SQL_CREATE_TRIGGERS: &str = "\
CREATE TRIGGER removals AFTER DELETE ON packages \
BEGIN \
  DELETE FROM files WHERE pkgKey = old.pkgKey; \
  DELETE FROM requires WHERE pkgKey = old.pkgKey; \
  DELETE FROM provides WHERE pkgKey = old.pkgKey; \
  DELETE FROM conflicts WHERE pkgKey = old.pkgKey; \
  DELETE FROM obsoletes WHERE pkgKey = old.pkgKey; \
END;";

const SQL_SELECT_PACKAGES: &str = "\
SELECT pkgKey, pkgId, name, arch, epoch, version, release, size_package, \
size_installed, size_archive, location_href, checksum_type, time_build \
FROM packages";

const SQL_INSERT_PACKAGE: &str = "\
INSERT INTO packages ( \
  name, arch, epoch, version, release, summary, description, url, time_file, \
  size_package, size_installed, size_archive, location_href, pkgId, \
  checksum_type, time_build, rpm_license, rpm_vendor, rpm_group, \
  rpm_buildhost, rpm_sourcerpm, rpm_header_start, rpm_header_end, rpm_packager \
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, \
?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)";

const SQL_INSERT_FILE: &str = "INSERT INTO files (name, type, pkgKey) VALUES (?1, ?2, ?3)";

/// One row of the `packages` table, projected down to the fields the mirror
/// pipeline needs. `pkg_id` is the content hash of the RPM itself.
#[derive(Debug, Clone)]
pub struct PackageEntry {
    pub key: i64,
    pub pkg_id: String,
    pub name: String,
    pub arch: String,
    pub epoch: String,
    pub version: String,
    pub release: String,
    pub package_size: u64,
    pub install_size: u64,
    pub archive_size: u64,
    pub location_href: String,
    pub checksum_type: String,
    pub build_time: i64,
}

impl PackageEntry {
    pub fn evr(&self) -> Evr {
        Evr::new(
            self.epoch.parse().unwrap_or(0),
            &self.version,
            &self.release,
        )
    }

    pub fn file_name(&self) -> &str {
        self.location_href
            .rsplit('/')
            .next()
            .unwrap_or(&self.location_href)
    }
}

impl std::fmt::Display for PackageEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}-{}-{}.{}",
            self.name, self.version, self.release, self.arch
        )
    }
}

/// The primary_db SQLite database of a package repository. All mutating
/// access goes through the single mutex-guarded connection; the planner
/// opens its own read-only instance.
pub struct PrimaryDb {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl PrimaryDb {
    /// Initializes a new, empty primary_db on disk. Any existing file at
    /// `path` is deleted first.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            fs::remove_file(path)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(SQL_CREATE_TABLES)?;
        conn.execute_batch(SQL_CREATE_INDEXES)?;
        conn.execute_batch(SQL_CREATE_TRIGGERS)?;
        conn.execute("INSERT INTO db_info (dbversion, checksum) VALUES (10, '')", [])?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_path_buf(),
        })
    }

    /// Opens an existing primary_db for reading.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All packages listed in the database.
    pub fn packages(&self) -> Result<Vec<PackageEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(SQL_SELECT_PACKAGES)?;

        let rows = stmt.query_map([], |row| {
            Ok(PackageEntry {
                key: row.get(0)?,
                pkg_id: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                name: row.get(2)?,
                arch: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                epoch: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                version: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
                release: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
                package_size: row.get::<_, Option<i64>>(7)?.unwrap_or(0) as u64,
                install_size: row.get::<_, Option<i64>>(8)?.unwrap_or(0) as u64,
                archive_size: row.get::<_, Option<i64>>(9)?.unwrap_or(0) as u64,
                location_href: row.get::<_, Option<String>>(10)?.unwrap_or_default(),
                checksum_type: row.get::<_, Option<String>>(11)?.unwrap_or_default(),
                build_time: row.get::<_, Option<i64>>(12)?.unwrap_or(0),
            })
        })?;

        let mut packages = Vec::new();
        for row in rows {
            packages.push(row?);
        }
        Ok(packages)
    }

    pub fn begin(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    pub fn commit(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("COMMIT")?;
        Ok(())
    }

    pub fn rollback(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    /// Inserts one package with its file list and dependency sets. Safe to
    /// call from multiple worker threads; each call serializes on the
    /// connection mutex.
    pub fn add_package(&self, pkg: &PackageMeta) -> Result<i64> {
        let conn = self.conn.lock().unwrap();

        {
            let mut stmt = conn.prepare_cached(SQL_INSERT_PACKAGE)?;
            stmt.execute(params![
                pkg.name,
                pkg.arch,
                pkg.epoch,
                pkg.version,
                pkg.release,
                pkg.summary,
                pkg.description,
                pkg.url,
                pkg.time_file,
                pkg.size_package as i64,
                pkg.size_installed as i64,
                pkg.size_archive as i64,
                pkg.location_href,
                pkg.checksum,
                pkg.checksum_type,
                pkg.time_build,
                pkg.license,
                pkg.vendor,
                pkg.group,
                pkg.buildhost,
                pkg.sourcerpm,
                pkg.header_start as i64,
                pkg.header_end as i64,
                pkg.packager,
            ])?;
        }
        let pkg_key = conn.last_insert_rowid();

        {
            let mut stmt = conn.prepare_cached(SQL_INSERT_FILE)?;
            for file in &pkg.files {
                stmt.execute(params![file, "file", pkg_key])?;
            }
        }

        for (table, deps) in [
            ("requires", &pkg.requires),
            ("provides", &pkg.provides),
            ("conflicts", &pkg.conflicts),
            ("obsoletes", &pkg.obsoletes),
        ] {
            let sql = if table == "requires" {
                "INSERT INTO requires (name, flags, epoch, version, release, pkgKey, pre) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
                    .to_string()
            } else {
                format!(
                    "INSERT INTO {table} (name, flags, epoch, version, release, pkgKey) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
                )
            };
            let mut stmt = conn.prepare_cached(&sql)?;
            for dep in deps {
                if table == "requires" {
                    stmt.execute(params![
                        dep.name, dep.flags, dep.epoch, dep.version, dep.release, pkg_key, dep.pre,
                    ])?;
                } else {
                    stmt.execute(params![
                        dep.name, dep.flags, dep.epoch, dep.version, dep.release, pkg_key,
                    ])?;
                }
            }
        }

        Ok(pkg_key)
    }

    /// All file paths recorded for the given package key.
    pub fn files_for(&self, pkg_key: i64) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT name FROM files WHERE pkgKey = ?1")?;
        let rows = stmt.query_map([pkg_key], |row| row.get(0))?;

        let mut files = Vec::new();
        for row in rows {
            files.push(row?);
        }
        Ok(files)
    }

    pub fn delete_package(&self, pkg_key: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM packages WHERE pkgKey = ?1", params![pkg_key])?;
        Ok(())
    }

    /// Closes the database, flushing everything to disk, and hands back the
    /// file path for compression.
    pub fn finish(self) -> Result<PathBuf> {
        let conn = Arc::try_unwrap(self.conn)
            .map_err(|_| Error::Internal("primary_db connection still shared".to_string()))?
            .into_inner()
            .unwrap();
        conn.close().map_err(|(_, err)| Error::Database(err))?;
        Ok(self.path)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use crate::rpmfile::DependencyMeta;

    use super::*;

    fn sample_package() -> PackageMeta {
        PackageMeta {
            name: "a".to_string(),
            arch: "noarch".to_string(),
            epoch: "0".to_string(),
            version: "1.0".to_string(),
            release: "1".to_string(),
            summary: "test package".to_string(),
            description: "a longer text".to_string(),
            url: "http://example.com".to_string(),
            license: "MIT".to_string(),
            vendor: "acme".to_string(),
            group: "Applications/System".to_string(),
            buildhost: "builder.example.com".to_string(),
            sourcerpm: "a-1.0-1.src.rpm".to_string(),
            packager: "tester".to_string(),
            time_file: 1000,
            time_build: 900,
            header_start: 96,
            header_end: 1024,
            size_package: 2048,
            size_installed: 4096,
            size_archive: 3072,
            location_href: "a-1.0-1.noarch.rpm".to_string(),
            checksum: "ab".repeat(32),
            checksum_type: "sha256".to_string(),
            files: vec!["/usr/bin/a".to_string(), "/etc/a.conf".to_string()],
            requires: vec![DependencyMeta {
                name: "libc.so.6".to_string(),
                flags: None,
                epoch: String::new(),
                version: String::new(),
                release: String::new(),
                pre: true,
            }],
            provides: vec![DependencyMeta {
                name: "a".to_string(),
                flags: Some("EQ".to_string()),
                epoch: "0".to_string(),
                version: "1.0".to_string(),
                release: "1".to_string(),
                pre: false,
            }],
            conflicts: Vec::new(),
            obsoletes: Vec::new(),
        }
    }

    #[test]
    fn test_insert_and_read_back() {
        let dir = tempdir().unwrap();
        let db = PrimaryDb::create(dir.path().join("primary_db.sqlite")).unwrap();

        db.begin().unwrap();
        let key = db.add_package(&sample_package()).unwrap();
        db.commit().unwrap();

        let packages = db.packages().unwrap();
        assert_eq!(packages.len(), 1);

        let entry = &packages[0];
        assert_eq!(entry.key, key);
        assert_eq!(entry.name, "a");
        assert_eq!(entry.arch, "noarch");
        assert_eq!(entry.epoch, "0");
        assert_eq!(entry.version, "1.0");
        assert_eq!(entry.release, "1");
        assert_eq!(entry.package_size, 2048);
        assert_eq!(entry.install_size, 4096);
        assert_eq!(entry.archive_size, 3072);
        assert_eq!(entry.location_href, "a-1.0-1.noarch.rpm");
        assert_eq!(entry.pkg_id, "ab".repeat(32));
        assert_eq!(entry.checksum_type, "sha256");
        assert_eq!(entry.build_time, 900);
        assert_eq!(entry.to_string(), "a-1.0-1.noarch");
    }

    #[test]
    fn test_files_and_dependencies_round_trip() {
        let dir = tempdir().unwrap();
        let db = PrimaryDb::create(dir.path().join("primary_db.sqlite")).unwrap();

        db.begin().unwrap();
        let key = db.add_package(&sample_package()).unwrap();
        db.commit().unwrap();

        let conn = db.conn.lock().unwrap();
        let file_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM files WHERE pkgKey = ?1", [key], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(file_count, 2);

        let (req_name, pre): (String, bool) = conn
            .query_row(
                "SELECT name, pre FROM requires WHERE pkgKey = ?1",
                [key],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(req_name, "libc.so.6");
        assert!(pre);

        let prov_flags: String = conn
            .query_row(
                "SELECT flags FROM provides WHERE pkgKey = ?1",
                [key],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(prov_flags, "EQ");
    }

    #[test]
    fn test_delete_cascades_via_trigger() {
        let dir = tempdir().unwrap();
        let db = PrimaryDb::create(dir.path().join("primary_db.sqlite")).unwrap();

        db.begin().unwrap();
        let key = db.add_package(&sample_package()).unwrap();
        db.commit().unwrap();

        db.delete_package(key).unwrap();

        let conn = db.conn.lock().unwrap();
        for table in ["files", "requires", "provides"] {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
                .unwrap();
            assert_eq!(count, 0, "{table} should be empty after cascade");
        }
    }

    #[test]
    fn test_open_missing_file() {
        let dir = tempdir().unwrap();
        assert!(PrimaryDb::open(dir.path().join("missing.sqlite")).is_err());
    }

    #[test]
    fn test_create_replaces_existing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("primary_db.sqlite");
        std::fs::write(&path, b"junk").unwrap();

        let db = PrimaryDb::create(&path).unwrap();
        assert!(db.packages().unwrap().is_empty());
    }

    #[test]
    fn test_finish_returns_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("primary_db.sqlite");
        let db = PrimaryDb::create(&path).unwrap();
        assert_eq!(db.finish().unwrap(), path);
    }
}
