use std::fs;
use std::io;
use std::path::Path;
use std::thread;
use std::time::Duration;

use log::debug;
use sha2::{Digest, Sha256};

const READ_ATTEMPTS: u32 = 3;
const READ_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Reads a text file, retrying briefly when another process holds it. A
/// leading UTF-8 byte order mark is dropped.
pub fn read_text_with_retry(path: &Path) -> io::Result<String> {
    let mut attempt = 1;
    loop {
        match fs::read_to_string(path) {
            Ok(text) => {
                return Ok(match text.strip_prefix('\u{feff}') {
                    Some(stripped) => stripped.to_string(),
                    None => text,
                })
            }
            Err(err) if attempt < READ_ATTEMPTS && is_transient(&err) => {
                debug!("retrying read of {} after: {err}", path.display());
                attempt += 1;
                thread::sleep(READ_RETRY_DELAY);
            }
            Err(err) => return Err(err),
        }
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::PermissionDenied | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

pub fn content_hash(bytes: &[u8]) -> String {
    hex_lower(&Sha256::digest(bytes))
}

/// `None` when the file does not exist or cannot be read.
pub fn file_hash(path: &Path) -> Option<String> {
    fs::read(path).ok().map(|bytes| content_hash(&bytes))
}

pub fn hex_lower(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_strip_byte_order_mark() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bom.tt");
        fs::write(&path, "\u{feff}hello").expect("write");
        assert_eq!(read_text_with_retry(&path).expect("read"), "hello");
        assert!(read_text_with_retry(&dir.path().join("missing.tt")).is_err());
    }

    #[test]
    fn hashes_are_lowercase_sha256() {
        assert_eq!(
            content_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(hex_lower(&[0x00, 0xab, 0x0f]), "00ab0f");
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(file_hash(&dir.path().join("missing")), None);
    }
}
