//! Bounds-checked little-endian reader over an in-memory buffer.
//!
//! Every read that would run past the end of the buffer fails with
//! `NotExecutableFormat("truncated ...")` instead of panicking, so foreign
//! binaries can be parsed without trusting their declared sizes.

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::errors::{Result, SandboxError};

#[derive(Debug)]
pub struct ByteCursor<B> {
    inner: Cursor<B>,
}

fn truncated(what: &str) -> SandboxError {
    SandboxError::format(format!("truncated while reading {what}"))
}

impl<B: AsRef<[u8]>> ByteCursor<B> {
    pub fn new(buf: B) -> Self {
        Self {
            inner: Cursor::new(buf),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.get_ref().as_ref().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn position(&self) -> usize {
        self.inner.position() as usize
    }

    pub fn remaining(&self) -> usize {
        self.len().saturating_sub(self.position())
    }

    /// Move to an absolute offset; the end of the buffer itself is a valid position.
    pub fn seek_to(&mut self, pos: usize, what: &str) -> Result<()> {
        if pos > self.len() {
            return Err(truncated(what));
        }
        self.inner.set_position(pos as u64);
        Ok(())
    }

    pub fn skip(&mut self, n: usize, what: &str) -> Result<()> {
        let target = self
            .position()
            .checked_add(n)
            .ok_or_else(|| truncated(what))?;
        self.seek_to(target, what)
    }

    pub fn read_u32(&mut self, what: &str) -> Result<u32> {
        self.inner
            .read_u32::<LittleEndian>()
            .map_err(|_| truncated(what))
    }

    pub fn read_i32(&mut self, what: &str) -> Result<i32> {
        self.inner
            .read_i32::<LittleEndian>()
            .map_err(|_| truncated(what))
    }

    pub fn read_u64(&mut self, what: &str) -> Result<u64> {
        self.inner
            .read_u64::<LittleEndian>()
            .map_err(|_| truncated(what))
    }

    pub fn read_array<const N: usize>(&mut self, what: &str) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        self.inner
            .read_exact(&mut out)
            .map_err(|_| truncated(what))?;
        Ok(out)
    }
}
