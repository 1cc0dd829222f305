//! Versions of the file tree, the edits between them, and compaction planning.

mod compaction;
mod edit;
mod file_metadata;
mod set;
#[expect(clippy::module_inception, reason = "the version module's central type")]
mod version;


pub(crate) use self::compaction::Compaction;
pub(crate) use self::edit::VersionEdit;
pub(crate) use self::file_metadata::FileMetadata;
pub(crate) use self::set::VersionSet;
pub(crate) use self::version::{GetResult, Version, total_file_size};
