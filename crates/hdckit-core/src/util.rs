//! Small helpers shared across the crate: version comparison for the
//! on-device agent, image magic sniffing for capture frames, and the
//! server pid-file lookup.

use std::cmp::Ordering;
use std::path::PathBuf;

/// Compare two dotted version strings numerically, component by component.
///
/// Missing components count as zero, so `"1.1" == "1.1.0"`. Non-numeric
/// components also count as zero.
pub fn cmp_version(a: &str, b: &str) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }
    let parse = |s: &str| -> Vec<u64> {
        s.split('.')
            .map(|c| c.trim().parse().unwrap_or(0))
            .collect()
    };
    let (av, bv) = (parse(a), parse(b));
    let n = av.len().max(bv.len());
    for i in 0..n {
        let ai = av.get(i).copied().unwrap_or(0);
        let bi = bv.get(i).copied().unwrap_or(0);
        match ai.cmp(&bi) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Extract the version that follows the `@v` marker in an agent library
/// identification line, e.g. `UITEST_AGENT_LIBRARY@v1.1.0`.
pub fn extract_version(raw: &str) -> Option<&str> {
    raw.split_once("@v").map(|(_, rest)| rest.trim())
}

/// Guess a file extension from image magic bytes. Capture frames are PNG
/// or JPEG depending on device build; anything else is opaque.
pub fn image_ext(data: &[u8]) -> &'static str {
    if data.len() >= 8 && data[..4] == [0x89, 0x50, 0x4E, 0x47] {
        "png"
    } else if data.len() >= 3 && data[..3] == [0xFF, 0xD8, 0xFF] {
        "jpg"
    } else {
        "bin"
    }
}

/// Path of the pid file the hdc server writes on startup.
pub fn server_pid_file() -> PathBuf {
    std::env::temp_dir().join(".HDCServer.pid")
}

/// Read the last known server pid, if the pid file exists and parses.
pub fn read_server_pid() -> Option<u32> {
    let raw = std::fs::read_to_string(server_pid_file()).ok()?;
    raw.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_equal() {
        assert_eq!(cmp_version("1.1.0", "1.1.0"), Ordering::Equal);
        assert_eq!(cmp_version("1.1", "1.1.0"), Ordering::Equal);
    }

    #[test]
    fn version_ordering() {
        assert_eq!(cmp_version("1.0.9", "1.1.0"), Ordering::Less);
        assert_eq!(cmp_version("1.2", "1.1.0"), Ordering::Greater);
        assert_eq!(cmp_version("2", "1.9.9"), Ordering::Greater);
    }

    #[test]
    fn version_non_numeric_counts_as_zero() {
        assert_eq!(cmp_version("abc", "0"), Ordering::Equal);
        assert_eq!(cmp_version("1.x", "1.0"), Ordering::Equal);
    }

    #[test]
    fn extracts_version_after_marker() {
        assert_eq!(
            extract_version("UITEST_AGENT_LIBRARY@v1.1.0\n"),
            Some("1.1.0")
        );
        assert_eq!(extract_version("no marker here"), None);
    }

    #[test]
    fn sniffs_png() {
        let png = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
        assert_eq!(image_ext(&png), "png");
    }

    #[test]
    fn sniffs_jpeg() {
        assert_eq!(image_ext(&[0xFF, 0xD8, 0xFF, 0xE0]), "jpg");
    }

    #[test]
    fn unknown_bytes_are_bin() {
        assert_eq!(image_ext(b"plain text"), "bin");
        assert_eq!(image_ext(&[]), "bin");
    }

    #[test]
    fn pid_file_lives_in_tempdir() {
        let path = server_pid_file();
        assert!(path.ends_with(".HDCServer.pid"));
    }
}
