//! Per-backend child log rotation — a spawned backend's stdout/stderr are
//! redirected to `bin/<model_tag>.log`, rotated by size using the same
//! `log_rotation_max_size_mb`/`log_rotation_keep_files` knobs the proxy's
//! own (currently unused) log file config carries.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// Sanitize a canonical model id (`owner/name:quant`) into a
/// filesystem-safe tag by replacing anything but alphanumerics, `-` and
/// `.` with `_`.
pub fn sanitize_tag(canonical: &str) -> String {
    canonical
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect()
}

pub fn log_path(bin_dir: &Path, canonical: &str) -> PathBuf {
    bin_dir.join(format!("{}.log", sanitize_tag(canonical)))
}

/// Open (rotating first if oversized) the log file a backend's stdout and
/// stderr should be redirected to.
pub fn open(bin_dir: &Path, canonical: &str, max_size_mb: u64, keep_files: u32) -> io::Result<File> {
    fs::create_dir_all(bin_dir)?;
    let path = log_path(bin_dir, canonical);
    rotate_if_needed(&path, max_size_mb, keep_files)?;
    OpenOptions::new().create(true).append(true).open(&path)
}

/// Shift `path.N -> path.N+1` for `N` up to `keep_files`, then move the
/// current log to `path.1`, if it is at or over `max_size_mb`.
fn rotate_if_needed(path: &Path, max_size_mb: u64, keep_files: u32) -> io::Result<()> {
    let max_bytes = max_size_mb * 1024 * 1024;
    let Ok(meta) = fs::metadata(path) else {
        return Ok(());
    };
    if meta.len() < max_bytes {
        return Ok(());
    }

    if keep_files > 0 {
        for n in (1..keep_files).rev() {
            let from = rotated_path(path, n);
            let to = rotated_path(path, n + 1);
            if from.exists() {
                let _ = fs::rename(&from, &to);
            }
        }
        let _ = fs::rename(path, rotated_path(path, 1));
    } else {
        let _ = fs::remove_file(path);
    }
    Ok(())
}

fn rotated_path(path: &Path, n: u32) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(format!(".{n}"));
    PathBuf::from(os)
}
