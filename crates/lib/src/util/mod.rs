//! Shared helpers.

#[cfg(test)]
pub mod testutil;

use sha1::{Digest, Sha1};

/// Hex-encoded SHA-1 of a byte slice.
///
/// SHA-1 is the digest the agent and blobstore protocols exchange, so it is
/// used for every wire-visible checksum.
pub fn sha1_hex(bytes: &[u8]) -> String {
  let mut hasher = Sha1::new();
  hasher.update(bytes);
  hex::encode(hasher.finalize())
}

/// Hex-encoded SHA-1 of a file's contents.
pub fn sha1_of_file(path: &std::path::Path) -> std::io::Result<String> {
  Ok(sha1_hex(&std::fs::read(path)?))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn sha1_matches_known_vector() {
    assert_eq!(sha1_hex(b"abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
  }

  #[test]
  fn sha1_of_file_reads_contents() {
    let temp = tempfile::TempDir::new().unwrap();
    let path = temp.path().join("data");
    std::fs::write(&path, b"abc").unwrap();

    assert_eq!(sha1_of_file(&path).unwrap(), "a9993e364706816aba3e25717850c26c9cd0d89d");
  }
}
