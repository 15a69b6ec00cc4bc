//! URL authentication hashes.

/// Minimum accepted hash length; anything shorter is too easy to brute
/// force.
pub const MIN_HASH_LENGTH: usize = 6;

/// Default hash length in hex digits.
pub const DEFAULT_HASH_LENGTH: usize = 8;

/// Derive the URL token for a document: the md5 of its name, decimal
/// size, mime type and decimal id, hex-encoded and truncated to
/// `hash_length` digits.
#[must_use]
pub fn short_hash(
    file_name: &str,
    size: u64,
    mime_type: &str,
    id: i64,
    hash_length: usize,
) -> String {
    let digest = md5::compute(format!("{file_name}{size}{mime_type}{id}"));

    let mut token = hex::encode(digest.0);
    token.truncate(hash_length);
    token
}

#[cfg(test)]
mod tests {
    use super::short_hash;

    #[test]
    fn known_digest() {
        // md5("video.mp4" "1048576" "video/mp4" "42")
        assert_eq!(
            short_hash("video.mp4", 1_048_576, "video/mp4", 42, 32),
            "0878861fd29af834a778b85331e8b79e"
        );
    }

    #[test]
    fn truncates_to_requested_length() {
        let full = short_hash("a.bin", 10, "application/octet-stream", 1, 32);
        let short = short_hash("a.bin", 10, "application/octet-stream", 1, 8);

        assert_eq!(short.len(), 8);
        assert_eq!(&full[..8], &short[..]);
    }

    #[test]
    fn every_field_contributes() {
        let base = short_hash("a.bin", 10, "video/mp4", 1, 16);

        assert_ne!(base, short_hash("b.bin", 10, "video/mp4", 1, 16));
        assert_ne!(base, short_hash("a.bin", 11, "video/mp4", 1, 16));
        assert_ne!(base, short_hash("a.bin", 10, "video/webm", 1, 16));
        assert_ne!(base, short_hash("a.bin", 10, "video/mp4", 2, 16));
    }
}
