//! Output path helpers
//!
//! Recordings are stored in the configured output directory, falling back to
//! ~/.local/share/multichannel-recorder/recordings/. Each recorded channel gets
//! its own file: `<base>_ch<NN>.wav`, NN being the 1-based position of the
//! channel in the request.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

/// Format of the default output name, derived from the command's creation time.
pub const TIMESTAMP_NAME_FORMAT: &str = "%Y-%m-%d_%H-%M-%S.wav";

/// Get the default recordings directory.
/// Returns: ~/.local/share/multichannel-recorder/recordings/
pub fn default_output_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("multichannel-recorder")
        .join("recordings")
}

/// Create `dir` if it doesn't exist.
pub fn create_output_dir(dir: &Path) -> std::io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    Ok(dir.to_path_buf())
}

/// Default output name for a recording created at `created_at`.
pub fn timestamped_name(created_at: DateTime<Utc>) -> String {
    created_at.format(TIMESTAMP_NAME_FORMAT).to_string()
}

/// Base name of an output name: extension stripped, no directories.
/// `None` when nothing usable is left.
pub fn base_name(output_name: &str) -> Option<String> {
    let trimmed = output_name.trim();
    if trimmed.is_empty() || trimmed.contains('/') || trimmed.contains('\\') {
        return None;
    }
    let stem = Path::new(trimmed).file_stem()?.to_str()?;
    if stem.is_empty() || stem == "." || stem == ".." {
        return None;
    }
    Some(stem.to_string())
}

/// File name of the channel at `position` (zero-based) in the request.
pub fn channel_file_name(base: &str, position: usize) -> String {
    format!("{}_ch{:02}.wav", base, position + 1)
}

/// Paths of all `count` channel files of a recording, in request order.
pub fn channel_paths(dir: &Path, base: &str, count: usize) -> Vec<PathBuf> {
    (0..count)
        .map(|position| dir.join(channel_file_name(base, position)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_channel_file_names_are_one_based() {
        assert_eq!(channel_file_name("take", 0), "take_ch01.wav");
        assert_eq!(channel_file_name("take", 9), "take_ch10.wav");
        assert_eq!(channel_file_name("take", 31), "take_ch32.wav");
    }

    #[test]
    fn test_base_name_strips_extension() {
        assert_eq!(base_name("2024-05-01_20-00-00.wav").as_deref(), Some("2024-05-01_20-00-00"));
        assert_eq!(base_name("sunday service").as_deref(), Some("sunday service"));
        assert_eq!(base_name("  "), None);
        assert_eq!(base_name("../escape.wav"), None);
        assert_eq!(base_name(".."), None);
    }

    #[test]
    fn test_timestamped_name_format() {
        let created = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(timestamped_name(created), "2024-03-09_07-05-01.wav");
    }

    #[test]
    fn test_channel_paths_follow_request_order() {
        let paths = channel_paths(Path::new("/rec"), "gig", 3);
        assert_eq!(
            paths,
            vec![
                PathBuf::from("/rec/gig_ch01.wav"),
                PathBuf::from("/rec/gig_ch02.wav"),
                PathBuf::from("/rec/gig_ch03.wav"),
            ]
        );
    }

    #[test]
    fn test_default_output_dir_contains_expected_path() {
        let dir = default_output_dir();
        let path_str = dir.to_string_lossy();
        assert!(path_str.contains("multichannel-recorder"));
        assert!(path_str.contains("recordings"));
    }
}
