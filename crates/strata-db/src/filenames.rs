//! Names of the files inside a database directory, and the `CURRENT` pointer protocol.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};


/// Every kind of file that may live in a database directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DbFileName {
    /// A write-ahead log segment, `%06u.log`.
    Log(u64),
    Lockfile,
    /// A table file, `%06u.ldb`.
    Table(u64),
    /// A table file with the legacy `.sst` extension; recognised on read, never written.
    TableLegacy(u64),
    /// A version-edit stream, `MANIFEST-%06u`.
    Manifest(u64),
    Current,
    /// Scratch file used for the atomic `CURRENT` swap, `%06u.dbtmp`.
    Temp(u64),
    InfoLog,
    OldInfoLog,
}

impl DbFileName {
    #[must_use]
    pub(crate) fn parse(file_name: &str) -> Option<Self> {
        // `from_str_radix` accepts a leading sign; real file numbers never carry one.
        let parse_number = |digits: &str| -> Option<u64> {
            if digits.is_empty() || !digits.bytes().all(|byte| byte.is_ascii_digit()) {
                return None;
            }
            digits.parse().ok()
        };

        if let Some(digits) = file_name.strip_suffix(".log") {
            parse_number(digits).map(Self::Log)
        } else if let Some(digits) = file_name.strip_suffix(".ldb") {
            parse_number(digits).map(Self::Table)
        } else if let Some(digits) = file_name.strip_suffix(".sst") {
            parse_number(digits).map(Self::TableLegacy)
        } else if let Some(digits) = file_name.strip_suffix(".dbtmp") {
            parse_number(digits).map(Self::Temp)
        } else if let Some(digits) = file_name.strip_prefix("MANIFEST-") {
            parse_number(digits).map(Self::Manifest)
        } else {
            match file_name {
                "LOCK"    => Some(Self::Lockfile),
                "CURRENT" => Some(Self::Current),
                "LOG"     => Some(Self::InfoLog),
                "LOG.old" => Some(Self::OldInfoLog),
                _         => None,
            }
        }
    }

    #[must_use]
    pub(crate) fn file_name(self) -> String {
        match self {
            Self::Log(number)         => format!("{number:06}.log"),
            Self::Lockfile            => "LOCK".to_owned(),
            Self::Table(number)       => format!("{number:06}.ldb"),
            Self::TableLegacy(number) => format!("{number:06}.sst"),
            Self::Manifest(number)    => format!("MANIFEST-{number:06}"),
            Self::Current             => "CURRENT".to_owned(),
            Self::Temp(number)        => format!("{number:06}.dbtmp"),
            Self::InfoLog             => "LOG".to_owned(),
            Self::OldInfoLog          => "LOG.old".to_owned(),
        }
    }

    #[must_use]
    pub(crate) fn path_in(self, db_path: &Path) -> PathBuf {
        db_path.join(self.file_name())
    }
}

/// Read the manifest file number named by `CURRENT`.
pub(crate) fn read_current_file(db_path: &Path) -> Result<u64> {
    let contents = fs::read_to_string(DbFileName::Current.path_in(db_path))?;
    let name = contents
        .strip_suffix('\n')
        .ok_or_else(|| Error::corruption("CURRENT file does not end with a newline"))?;

    match DbFileName::parse(name) {
        Some(DbFileName::Manifest(number)) => Ok(number),
        _ => Err(Error::corruption(format!("CURRENT names a non-manifest file {name:?}"))),
    }
}

/// Atomically point `CURRENT` at the given manifest, via a temp file and rename.
pub(crate) fn set_current_file(db_path: &Path, manifest_number: u64) -> Result<()> {
    let temp_path = DbFileName::Temp(manifest_number).path_in(db_path);
    let contents = format!("{}\n", DbFileName::Manifest(manifest_number).file_name());

    let write_result = (|| {
        let mut temp_file = fs::File::create(&temp_path)?;
        temp_file.write_all(contents.as_bytes())?;
        temp_file.sync_all()?;
        fs::rename(&temp_path, DbFileName::Current.path_in(db_path))
    })();

    if write_result.is_err() {
        let _best_effort = fs::remove_file(&temp_path);
    }
    write_result.map_err(Error::from)
}


#[cfg(test)]
mod tests {
    use super::*;


    #[test]
    fn names_round_trip_through_parse() {
        for file_name in [
            DbFileName::Log(7),
            DbFileName::Lockfile,
            DbFileName::Table(123_456),
            DbFileName::TableLegacy(8),
            DbFileName::Manifest(2),
            DbFileName::Current,
            DbFileName::Temp(99),
            DbFileName::InfoLog,
            DbFileName::OldInfoLog,
        ] {
            assert_eq!(DbFileName::parse(&file_name.file_name()), Some(file_name));
        }
    }

    #[test]
    fn rendered_names_match_the_on_disk_convention() {
        assert_eq!(DbFileName::Log(7).file_name(), "000007.log");
        assert_eq!(DbFileName::Table(42).file_name(), "000042.ldb");
        assert_eq!(DbFileName::Manifest(3).file_name(), "MANIFEST-000003");
        assert_eq!(DbFileName::Temp(5).file_name(), "000005.dbtmp");
    }

    #[test]
    fn junk_names_do_not_parse() {
        for junk in [
            "", "foo", "foo.log", "+12.log", "000001.ldb.bak", "MANIFEST-", "MANIFEST-+3",
            "MANIFEST-x", "current", "1e3.log",
        ] {
            assert_eq!(DbFileName::parse(junk), None, "parsed {junk:?}");
        }

        // Large numbers parse as long as they fit in a u64.
        assert_eq!(
            DbFileName::parse("18446744073709551615.log"),
            Some(DbFileName::Log(u64::MAX)),
        );
    }

    #[test]
    fn current_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        set_current_file(dir.path(), 123).unwrap();
        assert_eq!(read_current_file(dir.path()).unwrap(), 123);

        // Swapping is atomic-by-rename; the temp file must be gone.
        assert!(!DbFileName::Temp(123).path_in(dir.path()).exists());

        set_current_file(dir.path(), 124).unwrap();
        assert_eq!(read_current_file(dir.path()).unwrap(), 124);
    }
}
