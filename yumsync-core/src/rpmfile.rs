use std::{fs, path::Path, time::UNIX_EPOCH};

use crate::{
    checksum::{self, ChecksumAlgo},
    version::parse_evr,
    Result,
};

/// One dependency row destined for a requires/provides/conflicts/obsoletes
/// table. `flags` holds the comparison token (EQ, LT, LE, GE, GT) or nothing
/// for an unversioned dependency.
#[derive(Debug, Clone, Default)]
pub struct DependencyMeta {
    pub name: String,
    pub flags: Option<String>,
    pub epoch: String,
    pub version: String,
    pub release: String,
    pub pre: bool,
}

/// Everything the index builder stores for one RPM file.
#[derive(Debug, Clone)]
pub struct PackageMeta {
    pub name: String,
    pub arch: String,
    pub epoch: String,
    pub version: String,
    pub release: String,
    pub summary: String,
    pub description: String,
    pub url: String,
    pub license: String,
    pub vendor: String,
    pub group: String,
    pub buildhost: String,
    pub sourcerpm: String,
    pub packager: String,
    pub time_file: i64,
    pub time_build: i64,
    pub header_start: u64,
    pub header_end: u64,
    pub size_package: u64,
    pub size_installed: u64,
    pub size_archive: u64,
    pub location_href: String,
    pub checksum: String,
    pub checksum_type: String,
    pub files: Vec<String>,
    pub requires: Vec<DependencyMeta>,
    pub provides: Vec<DependencyMeta>,
    pub conflicts: Vec<DependencyMeta>,
    pub obsoletes: Vec<DependencyMeta>,
}

/// Reads the header of an RPM file into the shape the primary database
/// stores. The package content hash doubles as its `pkgId`.
pub fn read_package(path: &Path, algo: ChecksumAlgo) -> Result<PackageMeta> {
    let package = rpm::Package::open(path)?;
    let md = &package.metadata;

    let stat = fs::metadata(path)?;
    let time_file = stat
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    let offsets = md.get_package_segment_offsets();
    let size_archive = md
        .signature
        .get_entry_data_as_u32(rpm::IndexSignatureTag::RPMSIGTAG_PAYLOADSIZE)
        .map(u64::from)
        .unwrap_or(0);

    let files = md
        .get_file_entries()
        .unwrap_or_default()
        .into_iter()
        .filter(|entry| matches!(entry.mode, rpm::FileMode::Regular { .. }))
        .map(|entry| entry.path.display().to_string())
        .collect();

    let location_href = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    Ok(PackageMeta {
        name: md.get_name()?.to_string(),
        arch: md.get_arch().unwrap_or_default().to_string(),
        epoch: md.get_epoch().unwrap_or(0).to_string(),
        version: md.get_version()?.to_string(),
        release: md.get_release()?.to_string(),
        summary: md.get_summary().unwrap_or_default().to_string(),
        description: md.get_description().unwrap_or_default().to_string(),
        url: md.get_url().unwrap_or_default().to_string(),
        license: md.get_license().unwrap_or_default().to_string(),
        vendor: md.get_vendor().unwrap_or_default().to_string(),
        group: md.get_group().unwrap_or_default().to_string(),
        buildhost: md.get_build_host().unwrap_or_default().to_string(),
        sourcerpm: md.get_source_rpm().unwrap_or_default().to_string(),
        packager: md.get_packager().unwrap_or_default().to_string(),
        time_file,
        time_build: md.get_build_time().unwrap_or(0) as i64,
        header_start: offsets.header,
        header_end: offsets.payload,
        size_package: stat.len(),
        size_installed: md.get_installed_size().unwrap_or(0),
        size_archive,
        location_href,
        checksum: checksum::checksum_file(algo, path)?,
        checksum_type: algo.as_str().to_string(),
        files,
        requires: convert_deps(md.get_requires().unwrap_or_default()),
        provides: convert_deps(md.get_provides().unwrap_or_default()),
        conflicts: convert_deps(md.get_conflicts().unwrap_or_default()),
        obsoletes: convert_deps(md.get_obsoletes().unwrap_or_default()),
    })
}

/// Maps the comparison bits of a dependency to the text token stored in the
/// dependency tables.
fn flag_token(flags: rpm::DependencyFlags) -> Option<String> {
    let less = flags.contains(rpm::DependencyFlags::LESS);
    let greater = flags.contains(rpm::DependencyFlags::GREATER);
    let equal = flags.contains(rpm::DependencyFlags::EQUAL);

    let token = match (less, greater, equal) {
        (true, false, true) => "LE",
        (false, true, true) => "GE",
        (false, false, true) => "EQ",
        (true, false, false) => "LT",
        (false, true, false) => "GT",
        _ => return None,
    };
    Some(token.to_string())
}

fn convert_deps(deps: Vec<rpm::Dependency>) -> Vec<DependencyMeta> {
    deps.into_iter()
        .filter(|dep| !dep.flags.contains(rpm::DependencyFlags::RPMLIB))
        .map(|dep| {
            let (epoch, version, release) = parse_evr(&dep.version);
            let pre = dep.flags.intersects(
                rpm::DependencyFlags::PREREQ
                    | rpm::DependencyFlags::SCRIPT_PRE
                    | rpm::DependencyFlags::SCRIPT_POST,
            );
            DependencyMeta {
                name: dep.name,
                flags: flag_token(dep.flags),
                epoch,
                version,
                release,
                pre,
            }
        })
        .collect()
}
