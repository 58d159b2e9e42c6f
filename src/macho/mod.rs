#![allow(clippy::module_name_repetitions)]
//! Minimal Mach-O 64 reader: header, segment load commands and masked byte search.
//!
//! Only thin little-endian 64-bit images are accepted; universal (fat) and
//! 32-bit images are rejected as `NotExecutableFormat`.

pub mod cursor;
pub mod scan;

use std::ops::Range;

use crate::errors::{Result, SandboxError};
pub use cursor::ByteCursor;
pub use scan::{find_masked, matches_at};

pub const MH_MAGIC_64: u32 = 0xfeed_facf;
pub const MH_CIGAM_64: u32 = 0xcffa_edfe;
pub const FAT_MAGIC: u32 = 0xcafe_babe;
pub const FAT_CIGAM: u32 = 0xbeba_feca;

pub const LC_SEGMENT_64: u32 = 0x19;

/// Size of `mach_header_64` on disk.
pub const HEADER_SIZE: usize = 32;
/// Size of `segment_command_64` without its trailing sections.
pub const SEGMENT_COMMAND_SIZE: usize = 72;

/// Name of the segment holding machine code.
pub const TEXT_SEGMENT: &str = "__TEXT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachHeader {
    pub cputype: i32,
    pub cpusubtype: i32,
    pub filetype: u32,
    pub ncmds: u32,
    pub sizeofcmds: u32,
    pub flags: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub name: String,
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
}

impl Segment {
    /// On-disk byte range of this segment, checked against the file length.
    pub fn file_range(&self, file_len: u64) -> Result<Range<u64>> {
        let end = self
            .fileoff
            .checked_add(self.filesize)
            .ok_or_else(|| SandboxError::format(format!("segment {} size overflows", self.name)))?;
        if end > file_len {
            return Err(SandboxError::format(format!(
                "segment {} extends past end of file ({end} > {file_len})",
                self.name
            )));
        }
        Ok(self.fileoff..end)
    }
}

#[derive(Debug, Clone)]
pub struct MachImage {
    pub header: MachHeader,
    pub segments: Vec<Segment>,
}

impl MachImage {
    pub fn segment(&self, name: &str) -> Option<&Segment> {
        self.segments.iter().find(|s| s.name == name)
    }

    /// The code segment, required for fingerprinting.
    pub fn text_segment(&self) -> Result<&Segment> {
        self.segment(TEXT_SEGMENT)
            .ok_or_else(|| SandboxError::format("no __TEXT segment"))
    }
}

/// Validate the leading magic number of a Mach-O 64 image.
pub fn check_magic(magic: u32) -> Result<()> {
    match magic {
        MH_MAGIC_64 => Ok(()),
        MH_CIGAM_64 => Err(SandboxError::format("big-endian Mach-O is not supported")),
        FAT_MAGIC | FAT_CIGAM => Err(SandboxError::format(
            "universal (fat) binaries are not supported; extract a thin slice first",
        )),
        other => Err(SandboxError::format(format!("bad magic 0x{other:08x}"))),
    }
}

/// Number of bytes from the start of the file needed to parse all load commands.
pub fn header_and_commands_len(header: &[u8]) -> Result<usize> {
    let mut c = ByteCursor::new(header);
    check_magic(c.read_u32("magic")?)?;
    c.seek_to(20, "sizeofcmds")?;
    let sizeofcmds = c.read_u32("sizeofcmds")? as usize;
    Ok(HEADER_SIZE + sizeofcmds)
}

fn segment_name(raw: [u8; 16]) -> String {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Parse the header and every LC_SEGMENT_64 command. `bytes` must start at
/// the beginning of the image and contain at least the full load command area.
pub fn parse(bytes: &[u8]) -> Result<MachImage> {
    let mut c = ByteCursor::new(bytes);
    check_magic(c.read_u32("magic")?)?;
    let header = MachHeader {
        cputype: c.read_i32("cputype")?,
        cpusubtype: c.read_i32("cpusubtype")?,
        filetype: c.read_u32("filetype")?,
        ncmds: c.read_u32("ncmds")?,
        sizeofcmds: c.read_u32("sizeofcmds")?,
        flags: c.read_u32("flags")?,
    };
    c.read_u32("reserved")?;

    let commands_end = HEADER_SIZE
        .checked_add(header.sizeofcmds as usize)
        .ok_or_else(|| SandboxError::format("sizeofcmds overflows"))?;
    if commands_end > c.len() {
        return Err(SandboxError::format(format!(
            "load commands end at {commands_end} but only {} bytes available",
            c.len()
        )));
    }

    let mut segments = Vec::new();
    for i in 0..header.ncmds {
        let start = c.position();
        let cmd = c.read_u32("load command")?;
        let cmdsize = c.read_u32("load command size")? as usize;
        if cmdsize < 8 || start + cmdsize > commands_end {
            return Err(SandboxError::format(format!(
                "load command {i} has invalid size {cmdsize}"
            )));
        }
        if cmd == LC_SEGMENT_64 {
            if cmdsize < SEGMENT_COMMAND_SIZE {
                return Err(SandboxError::format(format!(
                    "segment command {i} too small ({cmdsize} bytes)"
                )));
            }
            let name = segment_name(c.read_array::<16>("segment name")?);
            let vmaddr = c.read_u64("vmaddr")?;
            let vmsize = c.read_u64("vmsize")?;
            let fileoff = c.read_u64("fileoff")?;
            let filesize = c.read_u64("filesize")?;
            segments.push(Segment {
                name,
                vmaddr,
                vmsize,
                fileoff,
                filesize,
            });
        }
        c.seek_to(start + cmdsize, "next load command")?;
    }

    Ok(MachImage { header, segments })
}


#[cfg(test)]
mod tests {
    use super::testutil::image;
    use super::*;

    #[test]
    fn test_parse_finds_text_segment() {
        let img = image(128, 64, 256);
        let parsed = parse(&img).expect("parse");
        assert_eq!(parsed.header.ncmds, 1);
        let text = parsed.text_segment().expect("text");
        assert_eq!(text.fileoff, 128);
        assert_eq!(text.filesize, 64);
        assert_eq!(text.file_range(256).unwrap(), 128..192);
    }

    #[test]
    fn test_rejects_fat_and_garbage_magic() {
        let mut img = image(128, 64, 256);
        img[..4].copy_from_slice(&FAT_MAGIC.to_le_bytes());
        assert!(matches!(parse(&img), Err(SandboxError::NotExecutableFormat(_))));
        assert!(matches!(
            parse(b"#!/bin/sh\necho hi\n"),
            Err(SandboxError::NotExecutableFormat(_))
        ));
    }

    #[test]
    fn test_truncated_load_commands_are_rejected() {
        let img = image(128, 64, 256);
        let err = parse(&img[..60]).unwrap_err();
        assert!(matches!(err, SandboxError::NotExecutableFormat(_)));
    }

    #[test]
    fn test_segment_past_eof_is_format_error() {
        let img = image(200, 100, 256);
        let parsed = parse(&img).unwrap();
        assert!(parsed.text_segment().unwrap().file_range(256).is_err());
    }

    #[test]
    fn test_header_and_commands_len() {
        let img = image(128, 64, 256);
        assert_eq!(
            header_and_commands_len(&img[..HEADER_SIZE]).unwrap(),
            HEADER_SIZE + SEGMENT_COMMAND_SIZE
        );
    }
}
