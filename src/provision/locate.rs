use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// File name of an executable on this platform (`php` -> `php.exe` on Windows)
pub fn platform_executable(stem: &str) -> String {
    if cfg!(windows) {
        format!("{}.exe", stem)
    } else {
        stem.to_string()
    }
}

/// Depth-first search for the first directory holding a file named `executable`.
///
/// Release archives nest the binary at varying depths. Within each directory
/// files are checked before descending, so a match closer to the root wins.
pub fn locate_executable(root: &Path, executable: &str) -> Option<PathBuf> {
    WalkDir::new(root)
        .follow_links(false)
        .sort_by(files_first)
        .into_iter()
        .filter_map(Result::ok)
        .find(|entry| entry.file_type().is_file() && entry.file_name() == executable)
        .and_then(|entry| entry.path().parent().map(Path::to_path_buf))
}

fn files_first(a: &DirEntry, b: &DirEntry) -> Ordering {
    a.file_type()
        .is_dir()
        .cmp(&b.file_type().is_dir())
        .then_with(|| a.file_name().cmp(b.file_name()))
}
