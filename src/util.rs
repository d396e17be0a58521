use std::time::Duration;

use sha2::{Digest, Sha256};

/// Render a human-friendly transfer speed string.
#[must_use]
pub fn format_speed(bytes_per_sec: f32) -> String {
    const KIB: f32 = 1024.0;
    const MIB: f32 = KIB * 1024.0;

    if bytes_per_sec < KIB {
        format!("{bytes_per_sec:.0} B/s")
    } else if bytes_per_sec < MIB {
        format!("{:.1} KB/s", bytes_per_sec / KIB)
    } else {
        format!("{:.1} MB/s", bytes_per_sec / MIB)
    }
}

/// Linear backoff: `base` after the first failure, `2 * base` after the second...
#[must_use]
pub fn backoff_delay(base: Duration, failed_attempts: u32) -> Duration {
    base.saturating_mul(failed_attempts.max(1))
}

#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_speed_human_readable() {
        assert_eq!(format_speed(512.0), "512 B/s");
        assert_eq!(format_speed(2_048.0), "2.0 KB/s");
        assert_eq!(format_speed(5_242_880.0), "5.0 MB/s");
    }

    #[test]
    fn backoff_grows_linearly() {
        let base = Duration::from_secs(3);
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(3));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(6));
        assert_eq!(backoff_delay(base, 0), Duration::from_secs(3));
    }

    #[test]
    fn hashes_hex_encoded() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
