//! Code-region fingerprinting for staleness detection.
//!
//! The fingerprint is FNV-1a 64 over the on-disk bytes of the `__TEXT`
//! segment. It only distinguishes "same code" from "different code"; it is
//! not a tamper-resistant digest.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

#[cfg(feature = "otel")]
use tracing::instrument;

use crate::errors::{Result, SandboxError};
use crate::macho;

pub const FNV_OFFSET: u64 = 14_695_981_039_346_656_037;
pub const FNV_PRIME: u64 = 1_099_511_628_211;

const CHUNK_SIZE: usize = 64 * 1024;

/// Streaming FNV-1a 64 accumulator.
#[derive(Debug, Clone, Copy)]
pub struct Fnv1a64(u64);

impl Default for Fnv1a64 {
    fn default() -> Self {
        Self(FNV_OFFSET)
    }
}

impl Fnv1a64 {
    pub fn update(&mut self, bytes: &[u8]) {
        let mut h = self.0;
        for b in bytes {
            h ^= u64::from(*b);
            h = h.wrapping_mul(FNV_PRIME);
        }
        self.0 = h;
    }

    pub fn finish(self) -> u64 {
        self.0
    }
}

pub fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut h = Fnv1a64::default();
    h.update(bytes);
    h.finish()
}

/// Sidecar text form: 16 lowercase hex digits.
pub fn format_fingerprint(fp: u64) -> String {
    format!("{fp:016x}")
}

pub fn parse_fingerprint(s: &str) -> Option<u64> {
    let t = s.trim();
    if t.is_empty() || t.len() > 16 {
        return None;
    }
    u64::from_str_radix(t, 16).ok()
}

/// Fingerprint of an executable already loaded in memory.
pub fn hash_executable_bytes(bytes: &[u8]) -> Result<u64> {
    let image = macho::parse(bytes)?;
    let range = image.text_segment()?.file_range(bytes.len() as u64)?;
    Ok(fnv1a64(&bytes[range.start as usize..range.end as usize]))
}

/// Fingerprint the code region of the executable at `path`, reading only the
/// load commands and the `__TEXT` segment from disk.
#[cfg_attr(
    feature = "otel",
    instrument(level = "debug", err, fields(path = %path.display()))
)]
pub fn hash_executable(path: &Path) -> Result<u64> {
    let mut f = File::open(path).map_err(|e| SandboxError::fs("open", path, e))?;
    let file_len = f
        .metadata()
        .map_err(|e| SandboxError::fs("stat", path, e))?
        .len();

    let mut head = vec![0u8; macho::HEADER_SIZE];
    if file_len < macho::HEADER_SIZE as u64 {
        return Err(SandboxError::format(format!(
            "{} is only {file_len} bytes",
            path.display()
        )));
    }
    f.read_exact(&mut head)
        .map_err(|e| SandboxError::fs("read", path, e))?;
    let needed = macho::header_and_commands_len(&head)?;
    if needed as u64 > file_len {
        return Err(SandboxError::format(format!(
            "load commands of {} extend past end of file",
            path.display()
        )));
    }
    head.resize(needed, 0);
    f.read_exact(&mut head[macho::HEADER_SIZE..])
        .map_err(|e| SandboxError::fs("read", path, e))?;

    let image = macho::parse(&head)?;
    let range = image.text_segment()?.file_range(file_len)?;

    f.seek(SeekFrom::Start(range.start))
        .map_err(|e| SandboxError::fs("seek", path, e))?;
    let mut left = range.end - range.start;
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut h = Fnv1a64::default();
    while left > 0 {
        let want = left.min(CHUNK_SIZE as u64) as usize;
        f.read_exact(&mut buf[..want])
            .map_err(|e| SandboxError::fs("read", path, e))?;
        h.update(&buf[..want]);
        left -= want as u64;
    }
    Ok(h.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macho::testutil::image;

    #[test]
    fn test_fnv_reference_values() {
        assert_eq!(fnv1a64(b""), FNV_OFFSET);
        assert_eq!(fnv1a64(b"a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(fnv1a64(b"foobar"), 0x8594_4171_f739_67e8);
    }

    #[test]
    fn test_streaming_equals_one_shot() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 253) as u8).collect();
        let mut h = Fnv1a64::default();
        for chunk in data.chunks(CHUNK_SIZE / 3) {
            h.update(chunk);
        }
        assert_eq!(h.finish(), fnv1a64(&data));
    }

    #[test]
    fn test_file_and_memory_agree() {
        let td = tempfile::tempdir().expect("tmpdir");
        let p = td.path().join("exe");
        let img = image(128, 64, 300);
        std::fs::write(&p, &img).unwrap();
        let on_disk = hash_executable(&p).expect("hash");
        assert_eq!(on_disk, hash_executable_bytes(&img).unwrap());
        assert_eq!(on_disk, fnv1a64(&img[128..192]));
    }

    #[test]
    fn test_only_code_region_counts() {
        let td = tempfile::tempdir().expect("tmpdir");
        let p = td.path().join("exe");
        let img = image(128, 64, 300);
        std::fs::write(&p, &img).unwrap();
        let base = hash_executable(&p).unwrap();
        assert_eq!(base, hash_executable(&p).unwrap());

        let mut inside = img.clone();
        inside[150] ^= 0x01;
        std::fs::write(&p, &inside).unwrap();
        assert_ne!(base, hash_executable(&p).unwrap());

        let mut outside = img.clone();
        outside[250] ^= 0x01;
        std::fs::write(&p, &outside).unwrap();
        assert_eq!(base, hash_executable(&p).unwrap());
    }

    #[test]
    fn test_non_macho_is_format_error() {
        let td = tempfile::tempdir().expect("tmpdir");
        let p = td.path().join("script");
        std::fs::write(&p, b"#!/bin/sh\nexit 0\n#########################\n").unwrap();
        assert!(matches!(
            hash_executable(&p),
            Err(SandboxError::NotExecutableFormat(_))
        ));
        let missing = td.path().join("missing");
        assert!(matches!(
            hash_executable(&missing),
            Err(SandboxError::Filesystem { .. })
        ));
    }

    #[test]
    fn test_fingerprint_text_round_trip() {
        assert_eq!(format_fingerprint(0xab), "00000000000000ab");
        assert_eq!(parse_fingerprint(" 00000000000000ab\n"), Some(0xab));
        assert_eq!(parse_fingerprint("zz"), None);
        assert_eq!(parse_fingerprint(""), None);
    }
}
