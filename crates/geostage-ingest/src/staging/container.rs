//! Container-vector staging (GeoPackage)
//!
//! Containers are opened read-only to enumerate their feature classes.
//! Archives wrapping a single container are flattened: the container moves
//! up and takes the canonicalized source name. Internal names sometimes
//! carry a `main.` qualifier; when a qualified name fails, the bare name
//! is retried before giving up.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use geostage_common::{GeostageError, Result};
use rusqlite::{Connection, OpenFlags};
use tracing::{debug, warn};

use crate::artifact::{RawArtifact, StagedEntry};
use crate::sources::{SourceDescriptor, StagedKind};

use super::{move_file, Materializer};

/// Leading qualifier some producers prepend to internal names
const KNOWN_QUALIFIER: &str = "main.";

const SQLITE_MAGIC: &[u8; 16] = b"SQLite format 3\0";

pub(super) fn stage(
    materializer: &Materializer<'_>,
    source: &SourceDescriptor,
    artifact: &RawArtifact,
) -> Result<Vec<StagedEntry>> {
    let dest_dir = materializer.source_dir(artifact);
    fs::create_dir_all(&dest_dir)?;

    let is_archive = artifact
        .payload_path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"));

    // Resolve the container file, unwrapping an archive when needed.
    let canonical_source = materializer.claim_name(artifact, &artifact.logical_name());
    let container_path = if is_archive {
        extract_container(artifact, &dest_dir, &canonical_source)?
    } else {
        let staged = dest_dir.join(format!("{}.gpkg", canonical_source));
        move_file(&artifact.payload_path, &staged)?;
        staged
    };

    validate_magic(&container_path)?;

    let layers = enumerate_feature_classes(&container_path).map_err(|e| {
        GeostageError::staging_validation(
            container_path.display().to_string(),
            format!("cannot enumerate feature classes: {}", e),
        )
    })?;
    if layers.is_empty() {
        return Err(GeostageError::staging_validation(
            container_path.display().to_string(),
            "container holds no feature classes",
        ));
    }

    // Apply the include allow-list, accepting both qualified and bare
    // spellings on either side.
    let selected: Vec<&FeatureClass> = if source.include.is_empty() {
        layers.iter().collect()
    } else {
        layers
            .iter()
            .filter(|fc| {
                source.include.iter().any(|wanted| {
                    names_match(wanted, &fc.name)
                })
            })
            .collect()
    };
    if selected.is_empty() {
        return Err(GeostageError::staging_validation(
            container_path.display().to_string(),
            format!(
                "no feature class matches the include list {:?} (available: {:?})",
                source.include,
                layers.iter().map(|l| l.name.as_str()).collect::<Vec<_>>()
            ),
        ));
    }

    let connection = open_read_only(&container_path)?;
    let mut entries = Vec::with_capacity(selected.len());
    for fc in selected {
        let feature_count = count_features(&connection, &fc.name);
        let canonical = materializer.claim_name(artifact, bare_name(&fc.name));
        let crs = fc.srs_id.filter(|srs| *srs > 0).map(|srs| format!("EPSG:{}", srs));
        entries.push(materializer.entry(
            artifact,
            canonical,
            container_path.clone(),
            StagedKind::ContainerVector,
            crs,
            feature_count,
            None,
        ));
    }
    Ok(entries)
}

/// Extract the single container member of an archive, renamed to the
/// canonical source name
fn extract_container(
    artifact: &RawArtifact,
    dest_dir: &Path,
    canonical_source: &str,
) -> Result<PathBuf> {
    let file = fs::File::open(&artifact.payload_path)?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| {
        GeostageError::staging_validation(
            artifact.payload_path.display().to_string(),
            format!("not a readable zip archive: {}", e),
        )
    })?;

    let mut container_members: Vec<String> = Vec::new();
    for i in 0..archive.len() {
        if let Ok(member) = archive.by_index(i) {
            if !member.is_dir() && member.name().to_lowercase().ends_with(".gpkg") {
                container_members.push(member.name().to_string());
            }
        }
    }

    let member_name = match container_members.as_slice() {
        [] => {
            return Err(GeostageError::staging_validation(
                artifact.payload_path.display().to_string(),
                "archive holds no container file",
            ));
        },
        [only] => only.clone(),
        [first, ..] => {
            warn!(
                archive = %artifact.payload_path.display(),
                count = container_members.len(),
                using = %first,
                "Multiple containers in archive, using the first"
            );
            first.clone()
        },
    };

    let staged = dest_dir.join(format!("{}.gpkg", canonical_source));
    let mut member = archive.by_name(&member_name).map_err(|e| {
        GeostageError::staging_validation(
            artifact.payload_path.display().to_string(),
            format!("cannot read archive member '{}': {}", member_name, e),
        )
    })?;
    let mut contents = Vec::with_capacity(member.size() as usize);
    member.read_to_end(&mut contents)?;
    fs::write(&staged, contents)?;
    debug!(member = %member_name, staged = %staged.display(), "Flattened archived container");
    Ok(staged)
}

fn validate_magic(path: &Path) -> Result<()> {
    let mut header = [0u8; 16];
    let mut file = fs::File::open(path)?;
    file.read_exact(&mut header).map_err(|_| {
        GeostageError::staging_validation(path.display().to_string(), "file too short for a container")
    })?;
    if &header != SQLITE_MAGIC {
        return Err(GeostageError::staging_validation(
            path.display().to_string(),
            "not a GeoPackage (bad magic bytes)",
        ));
    }
    Ok(())
}

#[derive(Debug)]
struct FeatureClass {
    name: String,
    srs_id: Option<i64>,
}

fn open_read_only(path: &Path) -> Result<Connection> {
    Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY).map_err(|e| {
        GeostageError::staging_validation(
            path.display().to_string(),
            format!("cannot open container: {}", e),
        )
    })
}

fn enumerate_feature_classes(path: &Path) -> rusqlite::Result<Vec<FeatureClass>> {
    let connection =
        Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    let mut statement = connection.prepare(
        "SELECT table_name, srs_id FROM gpkg_contents WHERE data_type = 'features' ORDER BY table_name",
    )?;
    let rows = statement.query_map([], |row| {
        Ok(FeatureClass {
            name: row.get(0)?,
            srs_id: row.get(1).ok(),
        })
    })?;
    rows.collect()
}

/// Row count for a feature class, retrying with the bare name when the
/// qualified spelling fails
fn count_features(connection: &Connection, name: &str) -> Option<u64> {
    match query_count(connection, name) {
        Ok(count) => Some(count),
        Err(_) if name.starts_with(KNOWN_QUALIFIER) => {
            let bare = bare_name(name);
            debug!(qualified = name, bare, "Qualified name failed, retrying bare");
            query_count(connection, bare).ok()
        },
        Err(e) => {
            warn!(table = name, error = %e, "Could not count features");
            None
        },
    }
}

fn query_count(connection: &Connection, table: &str) -> rusqlite::Result<u64> {
    // Table names come from gpkg_contents, not user input; quoting guards
    // against names with spaces or dots.
    let sql = format!("SELECT COUNT(*) FROM \"{}\"", table.replace('"', "\"\""));
    connection.query_row(&sql, [], |row| row.get::<_, i64>(0)).map(|n| n as u64)
}

fn bare_name(name: &str) -> &str {
    name.strip_prefix(KNOWN_QUALIFIER).unwrap_or(name)
}

/// Include-list comparison tolerant of the `main.` qualifier on either side
fn names_match(wanted: &str, actual: &str) -> bool {
    bare_name(wanted).eq_ignore_ascii_case(bare_name(actual))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn make_gpkg(path: &Path, tables: &[(&str, i64, usize)]) {
        let connection = Connection::open(path).unwrap();
        connection
            .execute_batch(
                "CREATE TABLE gpkg_contents (table_name TEXT, data_type TEXT, srs_id INTEGER);",
            )
            .unwrap();
        for (name, srs, rows) in tables {
            connection
                .execute(
                    "INSERT INTO gpkg_contents VALUES (?1, 'features', ?2)",
                    rusqlite::params![name, srs],
                )
                .unwrap();
            connection
                .execute_batch(&format!("CREATE TABLE \"{}\" (id INTEGER)", name))
                .unwrap();
            for i in 0..*rows {
                connection
                    .execute(&format!("INSERT INTO \"{}\" VALUES (?1)", name), [i as i64])
                    .unwrap();
            }
        }
    }

    #[test]
    fn test_enumerate_and_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.gpkg");
        make_gpkg(&path, &[("vatten", 3006, 3), ("main.bete", 3006, 5)]);

        let layers = enumerate_feature_classes(&path).unwrap();
        assert_eq!(layers.len(), 2);

        let connection = open_read_only(&path).unwrap();
        assert_eq!(count_features(&connection, "vatten"), Some(3));
        assert_eq!(count_features(&connection, "main.bete"), Some(5));
    }

    #[test]
    fn test_bare_name_retry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qualified.gpkg");
        // Registered with a qualifier, but the physical table is bare.
        let connection = Connection::open(&path).unwrap();
        connection
            .execute_batch(
                "CREATE TABLE gpkg_contents (table_name TEXT, data_type TEXT, srs_id INTEGER);
                 INSERT INTO gpkg_contents VALUES ('main.skog', 'features', 3006);
                 CREATE TABLE skog (id INTEGER);
                 INSERT INTO skog VALUES (1);
                 INSERT INTO skog VALUES (2);",
            )
            .unwrap();
        drop(connection);

        let read = open_read_only(&path).unwrap();
        assert_eq!(count_features(&read, "main.skog"), Some(2));
    }

    #[test]
    fn test_names_match_ignores_qualifier() {
        assert!(names_match("skog", "main.skog"));
        assert!(names_match("main.skog", "skog"));
        assert!(names_match("SKOG", "skog"));
        assert!(!names_match("skog", "vatten"));
    }

    #[test]
    fn test_validate_magic_rejects_non_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake.gpkg");
        fs::write(&path, b"definitely not a sqlite file").unwrap();
        assert!(validate_magic(&path).is_err());
    }
}
