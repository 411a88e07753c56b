// Small helpers shared across the gateway.

use std::fs;
use std::path::Path;

/// 128-bit random identifier, hex-encoded. Used for job and request ids.
pub fn new_hex_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

/// True when `path` is an existing regular file with at least one byte.
pub fn file_exists_non_empty(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_hex_id_shape() {
        let id = new_hex_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, new_hex_id());
    }

    #[test]
    fn test_file_exists_non_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");

        assert!(!file_exists_non_empty(&path));

        fs::write(&path, b"").unwrap();
        assert!(!file_exists_non_empty(&path));

        fs::write(&path, b"BYTES").unwrap();
        assert!(file_exists_non_empty(&path));

        assert!(!file_exists_non_empty(dir.path()));
    }
}
