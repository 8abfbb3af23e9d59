//! Split-vector staging (shapefiles and their archives)
//!
//! A shapefile is only usable with its `.shx` and `.dbf` companions
//! co-located. Archives are extracted flat; every valid primary member
//! becomes its own staged entry, and an invalid primary is skipped as long
//! as a sibling primary in the same archive validates.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use geostage_common::{GeostageError, Result};
use tracing::{debug, warn};

use crate::artifact::{RawArtifact, StagedEntry};
use crate::sources::{SourceDescriptor, StagedKind};

use super::{move_file, Materializer};

/// Companion extensions a primary `.shp` cannot live without
const REQUIRED_COMPANIONS: [&str; 2] = ["shx", "dbf"];

/// Optional companions carried along when present
const OPTIONAL_COMPANIONS: [&str; 5] = ["prj", "cpg", "sbn", "sbx", "qix"];

pub(super) fn stage_archive(
    materializer: &Materializer<'_>,
    source: &SourceDescriptor,
    artifact: &RawArtifact,
) -> Result<Vec<StagedEntry>> {
    let file = fs::File::open(&artifact.payload_path)?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| {
        GeostageError::staging_validation(
            artifact.payload_path.display().to_string(),
            format!("not a readable zip archive: {}", e),
        )
    })?;

    if archive.is_empty() {
        return Err(GeostageError::staging_validation(
            artifact.payload_path.display().to_string(),
            "empty archive",
        ));
    }

    // Member names, flattened to their final path component.
    let mut members: Vec<String> = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        if let Ok(member) = archive.by_index(i) {
            if !member.is_dir() {
                members.push(member.name().to_string());
            }
        }
    }

    let primaries: Vec<&String> = members
        .iter()
        .filter(|name| name.to_lowercase().ends_with(".shp"))
        .collect();
    if primaries.is_empty() {
        // The archive may wrap a container or JSON payload instead; the
        // include list decides whether that is acceptable.
        return Err(GeostageError::staging_validation(
            artifact.payload_path.display().to_string(),
            "archive holds no .shp member",
        ));
    }

    // Validate companions per primary inside the archive (same directory,
    // same stem).
    let mut valid: Vec<String> = Vec::new();
    let mut rejected: Vec<(String, Vec<String>)> = Vec::new();
    for primary in &primaries {
        let stem = trim_extension(primary);
        let missing: Vec<String> = REQUIRED_COMPANIONS
            .iter()
            .filter(|ext| {
                !members
                    .iter()
                    .any(|m| m.eq_ignore_ascii_case(&format!("{}.{}", stem, ext)))
            })
            .map(|ext| format!(".{}", ext))
            .collect();
        if missing.is_empty() {
            valid.push((*primary).clone());
        } else {
            // Try sibling primaries before failing the artifact.
            warn!(member = %primary, missing = ?missing, "Primary lacks companions, trying siblings");
            rejected.push(((*primary).clone(), missing));
        }
    }

    if valid.is_empty() {
        let detail = rejected
            .iter()
            .map(|(name, missing)| format!("{} (missing {})", name, missing.join(", ")))
            .collect::<Vec<_>>()
            .join("; ");
        return Err(GeostageError::staging_validation(
            artifact.payload_path.display().to_string(),
            format!("no shapefile with required companions: {}", detail),
        ));
    }

    // Apply the include allow-list by member stem when configured.
    let selected: Vec<String> = if source.include.is_empty() {
        valid
    } else {
        let wanted: Vec<String> = source
            .include
            .iter()
            .map(|s| s.to_lowercase())
            .collect();
        let filtered: Vec<String> = valid
            .iter()
            .filter(|name| {
                let stem = file_stem_of(name).to_lowercase();
                wanted.iter().any(|w| w == &stem)
            })
            .cloned()
            .collect();
        if filtered.is_empty() {
            debug!(source = %artifact.source_id, "No archive member matches the include list, staging all");
            valid
        } else {
            filtered
        }
    };

    let dest_dir = materializer.source_dir(artifact);
    fs::create_dir_all(&dest_dir)?;

    // Extract flat: the directory structure inside the archive is noise.
    for i in 0..archive.len() {
        let mut member = archive.by_index(i).map_err(|e| {
            GeostageError::staging_validation(
                artifact.payload_path.display().to_string(),
                format!("unreadable archive member: {}", e),
            )
        })?;
        if member.is_dir() {
            continue;
        }
        let member_name = member.name().to_string();
        let out_path = dest_dir.join(file_name_of(&member_name));
        let mut contents = Vec::with_capacity(member.size() as usize);
        member.read_to_end(&mut contents)?;
        fs::write(&out_path, contents)?;
    }

    let mut entries = Vec::with_capacity(selected.len());
    for primary in selected {
        let stem = file_stem_of(&primary);
        let canonical = materializer.claim_name(artifact, stem);
        let staged_shp =
            rename_family(&dest_dir, stem, &canonical).map_err(|e| {
                GeostageError::staging_validation(
                    artifact.payload_path.display().to_string(),
                    format!("cannot canonicalize '{}': {}", stem, e),
                )
            })?;
        let feature_count = dbf_record_count(&staged_shp.with_extension("dbf"));
        entries.push(materializer.entry(
            artifact,
            canonical,
            staged_shp,
            StagedKind::SplitVector,
            None,
            feature_count,
            None,
        ));
    }

    // Leftover extracted files not claimed by a primary stay in place;
    // they may be documentation or style files shipped with the data.
    Ok(entries)
}

/// Stage a split vector already uncompressed on disk
pub(super) fn stage_on_disk(
    materializer: &Materializer<'_>,
    artifact: &RawArtifact,
) -> Result<Vec<StagedEntry>> {
    let shp_path = &artifact.payload_path;
    let missing = missing_companions(shp_path);
    if !missing.is_empty() {
        return Err(GeostageError::staging_validation(
            shp_path.display().to_string(),
            format!("missing required companions: {}", missing.join(", ")),
        ));
    }

    let dest_dir = materializer.source_dir(artifact);
    fs::create_dir_all(&dest_dir)?;
    let stem = shp_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| artifact.source_id.clone());
    let canonical = materializer.claim_name(artifact, &stem);

    let mut staged_shp = dest_dir.join(format!("{}.shp", canonical));
    for ext in ["shp", "shx", "dbf"]
        .iter()
        .chain(OPTIONAL_COMPANIONS.iter())
    {
        let from = shp_path.with_extension(ext);
        if from.exists() {
            let to = dest_dir.join(format!("{}.{}", canonical, ext));
            move_file(&from, &to)?;
            if *ext == "shp" {
                staged_shp = to;
            }
        }
    }

    let feature_count = dbf_record_count(&staged_shp.with_extension("dbf"));
    Ok(vec![materializer.entry(
        artifact,
        canonical,
        staged_shp,
        StagedKind::SplitVector,
        None,
        feature_count,
        None,
    )])
}

/// Companion files missing next to an on-disk `.shp`
pub(crate) fn missing_companions(shp_path: &Path) -> Vec<String> {
    REQUIRED_COMPANIONS
        .iter()
        .filter(|ext| !shp_path.with_extension(ext).exists())
        .map(|ext| format!(".{}", ext))
        .collect()
}

/// Rename an extracted shapefile family to its canonical stem
fn rename_family(dir: &Path, stem: &str, canonical: &str) -> std::io::Result<PathBuf> {
    let mut staged_shp = dir.join(format!("{}.shp", canonical));
    for ext in ["shp", "shx", "dbf"]
        .iter()
        .chain(OPTIONAL_COMPANIONS.iter())
    {
        let from = dir.join(format!("{}.{}", stem, ext));
        if from.exists() {
            let to = dir.join(format!("{}.{}", canonical, ext));
            if from != to {
                fs::rename(&from, &to)?;
            }
            if *ext == "shp" {
                staged_shp = to;
            }
        }
    }
    Ok(staged_shp)
}

/// Record count from the dBASE header (bytes 4..8, little endian).
/// Best-effort: any read problem yields `None` rather than an error.
pub(crate) fn dbf_record_count(dbf_path: &Path) -> Option<u64> {
    let mut header = [0u8; 8];
    let mut file = fs::File::open(dbf_path).ok()?;
    file.read_exact(&mut header).ok()?;
    Some(u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as u64)
}

fn file_name_of(member: &str) -> &str {
    member.rsplit('/').next().unwrap_or(member)
}

fn file_stem_of(member: &str) -> &str {
    let name = file_name_of(member);
    name.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(name)
}

fn trim_extension(member: &str) -> &str {
    member.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(member)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_member_name_helpers() {
        assert_eq!(file_name_of("dir/sub/TILLTRADE.shp"), "TILLTRADE.shp");
        assert_eq!(file_stem_of("dir/TILLTRADE.shp"), "TILLTRADE");
        assert_eq!(trim_extension("dir/TILLTRADE.shp"), "dir/TILLTRADE");
    }

    #[test]
    fn test_dbf_record_count() {
        let dir = tempfile::tempdir().unwrap();
        let dbf = dir.path().join("x.dbf");
        // Minimal dBASE header: version byte, date, record count 2427.
        let mut header = vec![0x03u8, 99, 1, 1];
        header.extend_from_slice(&2427u32.to_le_bytes());
        header.extend_from_slice(&[0u8; 24]);
        fs::write(&dbf, header).unwrap();
        assert_eq!(dbf_record_count(&dbf), Some(2427));
        assert_eq!(dbf_record_count(&dir.path().join("absent.dbf")), None);
    }

    #[test]
    fn test_missing_companions() {
        let dir = tempfile::tempdir().unwrap();
        let shp = dir.path().join("a.shp");
        fs::write(&shp, b"shp").unwrap();
        fs::write(dir.path().join("a.shx"), b"shx").unwrap();
        assert_eq!(missing_companions(&shp), vec![".dbf"]);
        fs::write(dir.path().join("a.dbf"), b"dbf").unwrap();
        assert!(missing_companions(&shp).is_empty());
    }
}
