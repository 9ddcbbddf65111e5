//! Content fingerprints identifying samples to the remote service.

use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use super::DetectError;

/// Length of a fingerprint in hexadecimal characters.
pub const FINGERPRINT_LEN: usize = 32;

/// Lowercase hexadecimal MD5 digest of a sample.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Validate a caller-supplied fingerprint, normalizing it to lowercase.
    ///
    /// # Errors
    ///
    /// Returns `DetectError::InvalidFingerprint` unless the input is exactly
    /// 32 hexadecimal characters.
    pub fn parse(input: &str) -> Result<Self, DetectError> {
        let normalized = input.to_ascii_lowercase();
        let valid = normalized.len() == FINGERPRINT_LEN
            && normalized.bytes().all(|b| b.is_ascii_hexdigit());
        if valid {
            Ok(Self(normalized))
        } else {
            Err(DetectError::InvalidFingerprint(input.to_string()))
        }
    }

    /// Fingerprint of an in-memory buffer.
    #[must_use]
    pub fn of_bytes(data: &[u8]) -> Self {
        Self(format!("{:x}", Md5::digest(data)))
    }

    /// Fingerprint of a file, streamed in 64 KiB chunks.
    ///
    /// # Errors
    ///
    /// Returns `DetectError::FileNotFound` if the file cannot be opened or read.
    pub fn of_file(path: &Path) -> Result<Self, DetectError> {
        let not_found = || DetectError::FileNotFound {
            path: path.display().to_string(),
        };
        let file = File::open(path).map_err(|_| not_found())?;
        let mut reader = BufReader::new(file);
        let mut hasher = Md5::new();
        let mut buffer = [0u8; 64 * 1024];
        loop {
            let read = reader.read(&mut buffer).map_err(|_| not_found())?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        Ok(Self(format!("{:x}", hasher.finalize())))
    }

    /// The hexadecimal digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = DetectError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Fingerprint> for String {
    fn from(value: Fingerprint) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_normalizes_case() {
        let fp = Fingerprint::parse("D41D8CD98F00B204E9800998ECF8427E").unwrap();
        assert_eq!(fp.as_str(), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(Fingerprint::parse("").is_err());
        assert!(Fingerprint::parse("d41d8cd98f00b204e9800998ecf8427").is_err());
        assert!(Fingerprint::parse("d41d8cd98f00b204e9800998ecf8427e0").is_err());
        assert!(Fingerprint::parse("g41d8cd98f00b204e9800998ecf8427e").is_err());
        assert_eq!(
            Fingerprint::parse("xyz"),
            Err(DetectError::InvalidFingerprint("xyz".into()))
        );
    }

    #[test]
    fn test_empty_input_digest() {
        assert_eq!(Fingerprint::of_bytes(b"").as_str(), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn test_file_digest_matches_bytes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let body = vec![7u8; 200_000];
        file.write_all(&body).unwrap();
        file.flush().unwrap();

        let from_file = Fingerprint::of_file(file.path()).unwrap();
        assert_eq!(from_file, Fingerprint::of_bytes(&body));
    }

    #[test]
    fn test_missing_file() {
        let err = Fingerprint::of_file(Path::new("/definitely/not/here.bin")).unwrap_err();
        assert!(matches!(err, DetectError::FileNotFound { .. }));
    }
}
