//! Wallet resolution.
//!
//! The database credential store arrives either as a directory on disk or as
//! a base64-encoded ZIP archive packed into the environment. The archive form
//! is extracted to a fresh per-process directory with files created 0600.
//! Only `stored` and `deflate` entries are accepted, and entry CRCs are
//! verified before a file is kept.

use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::STANDARD, Engine};
use flate2::read::DeflateDecoder;
use thiserror::Error;

use crate::Settings;

/// The auto-login store every usable wallet must contain.
const SSO_FILE: &str = "cwallet.sso";

const EOCD_SIGNATURE: u32 = 0x0605_4b50;
const CENTRAL_SIGNATURE: u32 = 0x0201_4b50;
const LOCAL_SIGNATURE: u32 = 0x0403_4b50;

const METHOD_STORED: u16 = 0;
const METHOD_DEFLATE: u16 = 8;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("wallet directory {0:?} is missing {SSO_FILE}")]
    MissingSso(PathBuf),
    #[error("wallet base64 decoding failed: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("wallet archive is not a ZIP file")]
    NotZip,
    #[error("wallet archive entry {0:?} uses an unsupported compression method {1}")]
    UnsupportedMethod(String, u16),
    #[error("wallet archive entry {0:?} failed its CRC check")]
    CrcMismatch(String),
    #[error("wallet archive is truncated")]
    Truncated,
    #[error("wallet io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where the wallet ended up on disk, with `TNS_ADMIN`-ready path.
#[derive(Clone, Debug)]
pub struct WalletLocation {
    pub directory: PathBuf,
    /// True when the directory was extracted by us (archive form) rather
    /// than supplied by the operator.
    pub extracted: bool,
}

/// Resolves the configured wallet to a directory on disk, extracting the
/// base64 archive form when necessary.
pub fn resolve_wallet(settings: &Settings) -> Result<WalletLocation, WalletError> {
    if let Some(dir) = settings
        .oracle_wallet_location
        .as_deref()
        .filter(|v| !v.is_empty())
    {
        let directory = PathBuf::from(dir);
        validate_wallet_dir(&directory)?;
        return Ok(WalletLocation {
            directory,
            extracted: false,
        });
    }

    let encoded = settings
        .oracle_wallet_base64
        .as_deref()
        .unwrap_or_default();
    let archive = STANDARD.decode(encoded.trim())?;
    let directory = unique_extraction_dir();
    extract_zip(&archive, &directory)?;
    validate_wallet_dir(&directory)?;
    info!("wallet extracted"; "directory" => directory.display().to_string());
    Ok(WalletLocation {
        directory,
        extracted: true,
    })
}

fn validate_wallet_dir(dir: &Path) -> Result<(), WalletError> {
    if dir.join(SSO_FILE).is_file() {
        Ok(())
    } else {
        Err(WalletError::MissingSso(dir.to_path_buf()))
    }
}

fn unique_extraction_dir() -> PathBuf {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    std::env::temp_dir().join(format!("sentinel-wallet-{}-{}", std::process::id(), stamp))
}

fn read_u16(buf: &[u8], at: usize) -> Result<u16, WalletError> {
    let bytes = buf.get(at..at + 2).ok_or(WalletError::Truncated)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u32(buf: &[u8], at: usize) -> Result<u32, WalletError> {
    let bytes = buf.get(at..at + 4).ok_or(WalletError::Truncated)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

struct CentralEntry {
    name: String,
    method: u16,
    crc: u32,
    compressed_size: usize,
    local_offset: usize,
}

/// Extracts the archive into `target`. Directory entries are skipped and file
/// names are flattened to their base name so the layout matches a plain
/// wallet directory regardless of how the archive was built.
pub fn extract_zip(archive: &[u8], target: &Path) -> Result<(), WalletError> {
    let eocd = find_eocd(archive)?;
    let entry_count = read_u16(archive, eocd + 10)? as usize;
    let central_offset = read_u32(archive, eocd + 16)? as usize;

    fs::create_dir_all(target)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(target, fs::Permissions::from_mode(0o700))?;
    }

    let mut cursor = central_offset;
    for _ in 0..entry_count {
        let entry = read_central_entry(archive, &mut cursor)?;
        if entry.name.ends_with('/') {
            continue;
        }
        let contents = read_entry_bytes(archive, &entry)?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&contents);
        if hasher.finalize() != entry.crc {
            return Err(WalletError::CrcMismatch(entry.name));
        }

        let base_name = entry
            .name
            .rsplit('/')
            .next()
            .filter(|n| !n.is_empty())
            .ok_or(WalletError::NotZip)?;
        write_wallet_file(&target.join(base_name), &contents)?;
    }
    Ok(())
}

fn find_eocd(archive: &[u8]) -> Result<usize, WalletError> {
    if archive.len() < 22 {
        return Err(WalletError::NotZip);
    }
    // The end-of-central-directory record sits at the tail, possibly followed
    // by a comment of up to 64 KiB.
    let floor = archive.len().saturating_sub(22 + u16::MAX as usize);
    (floor..=archive.len() - 22)
        .rev()
        .find(|&at| matches!(read_u32(archive, at), Ok(sig) if sig == EOCD_SIGNATURE))
        .ok_or(WalletError::NotZip)
}

fn read_central_entry(archive: &[u8], cursor: &mut usize) -> Result<CentralEntry, WalletError> {
    let at = *cursor;
    if read_u32(archive, at)? != CENTRAL_SIGNATURE {
        return Err(WalletError::NotZip);
    }
    let method = read_u16(archive, at + 10)?;
    let crc = read_u32(archive, at + 16)?;
    let compressed_size = read_u32(archive, at + 20)? as usize;
    let name_len = read_u16(archive, at + 28)? as usize;
    let extra_len = read_u16(archive, at + 30)? as usize;
    let comment_len = read_u16(archive, at + 32)? as usize;
    let local_offset = read_u32(archive, at + 42)? as usize;

    let name_bytes = archive
        .get(at + 46..at + 46 + name_len)
        .ok_or(WalletError::Truncated)?;
    let name = String::from_utf8_lossy(name_bytes).into_owned();

    *cursor = at + 46 + name_len + extra_len + comment_len;
    Ok(CentralEntry {
        name,
        method,
        crc,
        compressed_size,
        local_offset,
    })
}

fn read_entry_bytes(archive: &[u8], entry: &CentralEntry) -> Result<Vec<u8>, WalletError> {
    let at = entry.local_offset;
    if read_u32(archive, at)? != LOCAL_SIGNATURE {
        return Err(WalletError::NotZip);
    }
    // Name and extra lengths in the local header may differ from the central
    // directory copy; trust the local ones for locating the data.
    let name_len = read_u16(archive, at + 26)? as usize;
    let extra_len = read_u16(archive, at + 28)? as usize;
    let data_start = at + 30 + name_len + extra_len;
    let data = archive
        .get(data_start..data_start + entry.compressed_size)
        .ok_or(WalletError::Truncated)?;

    match entry.method {
        METHOD_STORED => Ok(data.to_vec()),
        METHOD_DEFLATE => {
            let mut decoder = DeflateDecoder::new(data);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out)?;
            Ok(out)
        }
        other => Err(WalletError::UnsupportedMethod(entry.name.clone(), other)),
    }
}

fn write_wallet_file(path: &Path, contents: &[u8]) -> Result<(), WalletError> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{write::DeflateEncoder, Compression};

    /// Assembles a single-file ZIP archive by hand.
    fn build_zip(name: &str, contents: &[u8], method: u16) -> Vec<u8> {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(contents);
        let crc = hasher.finalize();

        let data = if method == METHOD_DEFLATE {
            let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(contents).unwrap();
            encoder.finish().unwrap()
        } else {
            contents.to_vec()
        };

        let mut archive = Vec::new();
        // local file header
        archive.extend_from_slice(&LOCAL_SIGNATURE.to_le_bytes());
        archive.extend_from_slice(&20u16.to_le_bytes()); // version needed
        archive.extend_from_slice(&0u16.to_le_bytes()); // flags
        archive.extend_from_slice(&method.to_le_bytes());
        archive.extend_from_slice(&0u32.to_le_bytes()); // mod time/date
        archive.extend_from_slice(&crc.to_le_bytes());
        archive.extend_from_slice(&(data.len() as u32).to_le_bytes());
        archive.extend_from_slice(&(contents.len() as u32).to_le_bytes());
        archive.extend_from_slice(&(name.len() as u16).to_le_bytes());
        archive.extend_from_slice(&0u16.to_le_bytes()); // extra len
        archive.extend_from_slice(name.as_bytes());
        archive.extend_from_slice(&data);

        let central_offset = archive.len() as u32;
        // central directory entry
        archive.extend_from_slice(&CENTRAL_SIGNATURE.to_le_bytes());
        archive.extend_from_slice(&20u16.to_le_bytes()); // version made by
        archive.extend_from_slice(&20u16.to_le_bytes()); // version needed
        archive.extend_from_slice(&0u16.to_le_bytes()); // flags
        archive.extend_from_slice(&method.to_le_bytes());
        archive.extend_from_slice(&0u32.to_le_bytes()); // mod time/date
        archive.extend_from_slice(&crc.to_le_bytes());
        archive.extend_from_slice(&(data.len() as u32).to_le_bytes());
        archive.extend_from_slice(&(contents.len() as u32).to_le_bytes());
        archive.extend_from_slice(&(name.len() as u16).to_le_bytes());
        archive.extend_from_slice(&0u16.to_le_bytes()); // extra len
        archive.extend_from_slice(&0u16.to_le_bytes()); // comment len
        archive.extend_from_slice(&0u16.to_le_bytes()); // disk number
        archive.extend_from_slice(&0u16.to_le_bytes()); // internal attrs
        archive.extend_from_slice(&0u32.to_le_bytes()); // external attrs
        archive.extend_from_slice(&0u32.to_le_bytes()); // local offset
        archive.extend_from_slice(name.as_bytes());

        let central_size = archive.len() as u32 - central_offset;
        // end of central directory
        archive.extend_from_slice(&EOCD_SIGNATURE.to_le_bytes());
        archive.extend_from_slice(&0u16.to_le_bytes()); // disk number
        archive.extend_from_slice(&0u16.to_le_bytes()); // central dir disk
        archive.extend_from_slice(&1u16.to_le_bytes()); // entries on disk
        archive.extend_from_slice(&1u16.to_le_bytes()); // entries total
        archive.extend_from_slice(&central_size.to_le_bytes());
        archive.extend_from_slice(&central_offset.to_le_bytes());
        archive.extend_from_slice(&0u16.to_le_bytes()); // comment len
        archive
    }

    #[test]
    fn extracts_stored_entries() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("wallet");
        let archive = build_zip(SSO_FILE, b"sso-bytes", METHOD_STORED);

        extract_zip(&archive, &target).unwrap();
        assert_eq!(fs::read(target.join(SSO_FILE)).unwrap(), b"sso-bytes");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(target.join(SSO_FILE))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn extracts_deflate_entries() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("wallet");
        let body = b"tnsnames contents tnsnames contents tnsnames contents".repeat(8);
        let archive = build_zip("tnsnames.ora", &body, METHOD_DEFLATE);

        extract_zip(&archive, &target).unwrap();
        assert_eq!(fs::read(target.join("tnsnames.ora")).unwrap(), body);
    }

    #[test]
    fn rejects_unsupported_methods() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("wallet");
        // Method 12 is bzip2, which we do not accept.
        let archive = build_zip(SSO_FILE, b"x", 12);

        match extract_zip(&archive, &target) {
            Err(WalletError::UnsupportedMethod(name, 12)) => assert_eq!(name, SSO_FILE),
            other => panic!("expected UnsupportedMethod, got {:?}", other),
        }
    }

    #[test]
    fn rejects_corrupt_entries() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("wallet");
        let mut archive = build_zip(SSO_FILE, b"sso-bytes", METHOD_STORED);
        // Flip a payload byte; the local header starts with a 30-byte fixed
        // part plus the name, so the payload begins right after.
        let payload_at = 30 + SSO_FILE.len();
        archive[payload_at] ^= 0xff;

        assert!(matches!(
            extract_zip(&archive, &target),
            Err(WalletError::CrcMismatch(_))
        ));
    }

    #[test]
    fn garbage_is_not_a_zip() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            extract_zip(b"definitely not an archive", &dir.path().join("w")),
            Err(WalletError::NotZip)
        ));
    }
}
