//! Purpose: Decide which rotation file receives the next cutover, without performing any I/O.
//! Exports: `RotationEntry`, `snapshot_dir`, `next_file_name`, `rotation_index`, `rotation_file_name`.
//! Role: Pure allocation layer used by `ring`; the directory listing is the only ledger.
//! Invariants: Output depends only on the snapshot, prefix, suffix, and file count.
//! Invariants: Returned indices always fall in `[1, file_count]`.
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::SystemTime;

use crate::core::error::{Error, ErrorKind};

/// One directory entry as seen by the allocator.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RotationEntry {
    pub name: String,
    pub modified: SystemTime,
}

impl RotationEntry {
    pub fn new(name: impl Into<String>, modified: SystemTime) -> Self {
        Self {
            name: name.into(),
            modified,
        }
    }
}

/// Lists `dir` into allocator input. Entries with non UTF-8 names cannot be
/// rotation files and are skipped; any other failure is returned.
pub fn snapshot_dir(dir: &Path) -> Result<Vec<RotationEntry>, Error> {
    let read_dir = fs::read_dir(dir).map_err(|err| {
        Error::io(err)
            .with_message("could not read directory")
            .with_path(dir)
    })?;

    let mut entries = Vec::new();
    for entry in read_dir {
        let entry = entry.map_err(|err| {
            Error::io(err)
                .with_message("could not read directory entry")
                .with_path(dir)
        })?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        let modified = entry
            .metadata()
            .and_then(|meta| meta.modified())
            .map_err(|err| {
                Error::io(err)
                    .with_message("could not stat directory entry")
                    .with_path(entry.path())
            })?;
        entries.push(RotationEntry { name, modified });
    }
    Ok(entries)
}

pub fn rotation_file_name(prefix: &str, index: u32, suffix: &str) -> String {
    format!("{prefix}.{index:02}.{suffix}")
}

/// Parses `<prefix>.<digits>.<suffix>`; the whole name must match.
pub fn rotation_index(name: &str, prefix: &str, suffix: &str) -> Option<u32> {
    let digits = name
        .strip_prefix(prefix)?
        .strip_prefix('.')?
        .strip_suffix(suffix)?
        .strip_suffix('.')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Picks the name of the file the next rotation should (re)create.
///
/// Below capacity this is the lowest index not yet present, so a fresh
/// directory fills `01`, `02`, ... in order. At capacity it is the member
/// with the oldest modification time; ties go to the first one listed.
pub fn next_file_name(
    entries: &[RotationEntry],
    prefix: &str,
    suffix: &str,
    file_count: u32,
) -> String {
    let mut members: BTreeMap<u32, usize> = BTreeMap::new();
    for (pos, entry) in entries.iter().enumerate() {
        let Some(index) = rotation_index(&entry.name, prefix, suffix) else {
            continue;
        };
        if index == 0 || index > file_count {
            continue;
        }
        members.entry(index).or_insert(pos);
    }

    if (members.len() as u32) < file_count {
        let free = (1..=file_count)
            .find(|index| !members.contains_key(index))
            .unwrap_or(file_count);
        return rotation_file_name(prefix, free, suffix);
    }

    let mut oldest: Option<&RotationEntry> = None;
    for entry in entries {
        match rotation_index(&entry.name, prefix, suffix) {
            Some(index) if index >= 1 && index <= file_count => {}
            _ => continue,
        }
        match oldest {
            Some(current) if current.modified <= entry.modified => {}
            _ => oldest = Some(entry),
        }
    }
    match oldest {
        Some(entry) => entry.name.clone(),
        None => rotation_file_name(prefix, 1, suffix),
    }
}

pub(crate) fn validate_prefix(prefix: &str) -> Result<(), Error> {
    if prefix.is_empty() {
        return Err(Error::new(ErrorKind::Usage).with_message("prefix must not be empty"));
    }
    if prefix.contains('/') || prefix.contains(std::path::MAIN_SEPARATOR) {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("prefix must not contain path separators")
            .with_hint("Pass the directory separately and keep the prefix a bare name."));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{
        RotationEntry, next_file_name, rotation_file_name, rotation_index, snapshot_dir,
        validate_prefix,
    };
    use crate::core::error::ErrorKind;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn entry(name: &str, secs: u64) -> RotationEntry {
        RotationEntry::new(name, at(secs))
    }

    #[test]
    fn empty_directory_allocates_first_index() {
        assert_eq!(next_file_name(&[], "app", "zstd", 4), "app.01.zstd");
    }

    #[test]
    fn below_capacity_allocates_next_index() {
        let entries = [entry("app.01.zstd", 10), entry("app.02.zstd", 20)];
        assert_eq!(next_file_name(&entries, "app", "zstd", 4), "app.03.zstd");
    }

    #[test]
    fn gaps_are_filled_before_growing() {
        let entries = [entry("app.01.zstd", 10), entry("app.03.zstd", 20)];
        assert_eq!(next_file_name(&entries, "app", "zstd", 4), "app.02.zstd");
    }

    #[test]
    fn full_set_reuses_least_recently_modified() {
        let entries = [
            entry("app.01.zstd", 40),
            entry("app.02.zstd", 50),
            entry("app.03.zstd", 15),
            entry("app.04.zstd", 30),
        ];
        assert_eq!(next_file_name(&entries, "app", "zstd", 4), "app.03.zstd");
    }

    #[test]
    fn ties_go_to_first_listed() {
        let entries = [
            entry("app.02.zstd", 10),
            entry("app.01.zstd", 10),
            entry("app.03.zstd", 10),
        ];
        assert_eq!(next_file_name(&entries, "app", "zstd", 3), "app.02.zstd");
    }

    #[test]
    fn foreign_and_malformed_names_are_ignored() {
        let entries = [
            entry("other.01.zstd", 1),
            entry("app.01.log", 1),
            entry("app.xx.zstd", 1),
            entry("app..zstd", 1),
            entry("app.01.zstd.bak", 1),
            entry("app.99999999999999999999.zstd", 1),
            entry("app.01.zstd", 5),
        ];
        assert_eq!(next_file_name(&entries, "app", "zstd", 2), "app.02.zstd");
    }

    #[test]
    fn indices_beyond_file_count_are_not_members() {
        let entries = [
            entry("app.01.zstd", 30),
            entry("app.02.zstd", 40),
            entry("app.07.zstd", 1),
        ];
        assert_eq!(next_file_name(&entries, "app", "zstd", 2), "app.01.zstd");
    }

    #[test]
    fn prefix_with_dots_is_matched_literally() {
        assert_eq!(rotation_index("svc.api.03.zstd", "svc.api", "zstd"), Some(3));
        assert_eq!(rotation_index("svcXapi.03.zstd", "svc.api", "zstd"), None);
    }

    #[test]
    fn file_names_are_zero_padded() {
        assert_eq!(rotation_file_name("app", 7, "zstd"), "app.07.zstd");
        assert_eq!(rotation_file_name("app", 12, "log"), "app.12.log");
    }

    #[test]
    fn prefix_validation_rejects_separators() {
        assert!(validate_prefix("app").is_ok());
        let err = validate_prefix("nested/app").expect_err("separator");
        assert_eq!(err.kind(), ErrorKind::Usage);
        let err = validate_prefix("").expect_err("empty");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn snapshot_lists_directory_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("app.01.zstd"), b"x").expect("write");
        std::fs::write(dir.path().join("notes.txt"), b"y").expect("write");

        let mut names: Vec<String> = snapshot_dir(dir.path())
            .expect("snapshot")
            .into_iter()
            .map(|entry| entry.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["app.01.zstd".to_string(), "notes.txt".to_string()]);
    }

    #[test]
    fn snapshot_of_missing_directory_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = snapshot_dir(&dir.path().join("missing")).expect_err("missing dir");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
