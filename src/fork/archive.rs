//! Manifest archive for long boot paths.
//!
//! When the inline boot-path argument would blow past platform command-line
//! limits (or modular isolation is requested), the launcher writes a tiny
//! Zip32 archive whose manifest carries the boot path, and hands the worker
//! just the archive path. Entries are stored uncompressed with fixed
//! timestamps and explicit sizes, so the bytes are deterministic.

use std::io;
use std::path::{Path, PathBuf};

const MANIFEST_NAME: &str = "META-INF/MANIFEST.MF";

fn u16le(v: u16) -> [u8; 2] {
    v.to_le_bytes()
}

fn u32le(v: u32) -> [u8; 4] {
    v.to_le_bytes()
}

/// Render the manifest body carrying the boot path entries.
fn manifest_text(boot_paths: &[PathBuf]) -> String {
    let mut text = String::from("Manifest-Version: 1.0\nCreated-By: kiln\n");
    for path in boot_paths {
        text.push_str("Boot-Path: ");
        text.push_str(&path.display().to_string());
        text.push('\n');
    }
    text
}

/// Build the archive bytes: one stored manifest entry plus the central
/// directory and end record.
pub fn manifest_archive_bytes(boot_paths: &[PathBuf]) -> Vec<u8> {
    let payload = manifest_text(boot_paths).into_bytes();
    let name = MANIFEST_NAME.as_bytes();

    let mut out = Vec::new();
    let local_off = out.len() as u32;

    // Local file header, store method, no data descriptor.
    out.extend_from_slice(&u32le(0x0403_4b50));
    out.extend_from_slice(&u16le(20));
    out.extend_from_slice(&u16le(0));
    out.extend_from_slice(&u16le(0));
    out.extend_from_slice(&u16le(0));
    out.extend_from_slice(&u16le(0));
    out.extend_from_slice(&u32le(0));
    out.extend_from_slice(&u32le(payload.len() as u32));
    out.extend_from_slice(&u32le(payload.len() as u32));
    out.extend_from_slice(&u16le(name.len() as u16));
    out.extend_from_slice(&u16le(0));
    out.extend_from_slice(name);
    out.extend_from_slice(&payload);

    // Central directory.
    let cd_start = out.len() as u32;
    out.extend_from_slice(&u32le(0x0201_4b50));
    out.extend_from_slice(&u16le(0));
    out.extend_from_slice(&u16le(20));
    out.extend_from_slice(&u16le(0));
    out.extend_from_slice(&u16le(0));
    out.extend_from_slice(&u16le(0));
    out.extend_from_slice(&u16le(0));
    out.extend_from_slice(&u32le(0));
    out.extend_from_slice(&u32le(payload.len() as u32));
    out.extend_from_slice(&u32le(payload.len() as u32));
    out.extend_from_slice(&u16le(name.len() as u16));
    out.extend_from_slice(&u16le(0));
    out.extend_from_slice(&u16le(0));
    out.extend_from_slice(&u16le(0));
    out.extend_from_slice(&u16le(0));
    out.extend_from_slice(&u32le(0));
    out.extend_from_slice(&u32le(local_off));
    out.extend_from_slice(name);
    let cd_size = out.len() as u32 - cd_start;

    // End of central directory.
    out.extend_from_slice(&u32le(0x0605_4b50));
    out.extend_from_slice(&u16le(0));
    out.extend_from_slice(&u16le(0));
    out.extend_from_slice(&u16le(1));
    out.extend_from_slice(&u16le(1));
    out.extend_from_slice(&u32le(cd_size));
    out.extend_from_slice(&u32le(cd_start));
    out.extend_from_slice(&u16le(0));

    out
}

/// Read the boot paths back out of an archive written by
/// [`manifest_archive_bytes`].
pub fn read_boot_paths(archive: &Path) -> io::Result<Vec<PathBuf>> {
    let bytes = std::fs::read(archive)?;
    let header_len = 30 + MANIFEST_NAME.len();
    if bytes.len() < header_len || !bytes.starts_with(&u32le(0x0403_4b50)) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "not a kiln manifest archive",
        ));
    }
    let size = u32::from_le_bytes([bytes[22], bytes[23], bytes[24], bytes[25]]) as usize;
    let payload = bytes
        .get(header_len..header_len + size)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "truncated manifest entry"))?;
    let text = String::from_utf8_lossy(payload);
    Ok(text
        .lines()
        .filter_map(|line| line.strip_prefix("Boot-Path: "))
        .map(PathBuf::from)
        .collect())
}
