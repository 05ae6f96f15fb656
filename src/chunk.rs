/*
sfmap, to encode and flash sparse images: chunk classifier module
Copyright (C) 2024-present Guoxin "7Ji" Pu

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as
published by the Free Software Foundation, either version 3 of the
License, or (at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

use std::{fmt::Display, io::{ErrorKind, Read}};

use serde::{Serialize, Deserialize};

use crate::{pretty::human_bytes, Result};

/* Both values are baked into every SFMap ever written */

/// Size of a chunk, the unit of classification and of transfer
pub(crate) const CHUNK_SIZE: usize = 0x8000;
pub(crate) const CHUNK_SIZE_U64: u64 = CHUNK_SIZE as u64;

/// Little-endian word that marks a blank cell. This is a magic value and not
/// the erased state of any flash.
pub(crate) const SENTINEL: u64 = 0xb8724018f1c8c07d;

const SIZE_WORD: usize = std::mem::size_of::<u64>();

pub(crate) type ChunkBuffer = [u8; CHUNK_SIZE];

/// A meaningful chunk and where it lives on the target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Chunk {
    pub(crate) offset: u64,
    pub(crate) data: Vec<u8>,
}

impl Chunk {
    /// Offset right after this chunk, where a contiguous successor starts
    pub(crate) fn end(&self) -> u64 {
        self.offset + CHUNK_SIZE_U64
    }
}

/// Fill a buffer with the sentinel pattern, a trailing partial word gets the
/// leading bytes of the pattern
pub(crate) fn fill_sentinel(buffer: &mut [u8]) {
    let pattern = SENTINEL.to_le_bytes();
    for (id, byte) in buffer.iter_mut().enumerate() {
        *byte = pattern[id % SIZE_WORD]
    }
}

pub(crate) fn is_blank(buffer: &[u8]) -> bool {
    buffer.chunks_exact(SIZE_WORD).all(|raw| {
        let mut word = [0; SIZE_WORD];
        word.copy_from_slice(raw);
        u64::from_le_bytes(word) == SENTINEL
    })
}

/// Fill the buffer as far as the reader allows, returning how many bytes were
/// read. Anything short of a full buffer means the input has ended.
pub(crate) fn read_chunk<R: Read>(reader: &mut R, buffer: &mut ChunkBuffer)
    -> Result<usize>
{
    let mut filled = 0;
    while filled < CHUNK_SIZE {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(size) => filled += size,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

/// Bytes scanned and bytes found blank during one encode
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Tally {
    pub(crate) total: u64,
    pub(crate) empty: u64,
}

impl Tally {
    pub(crate) fn kept(&self) -> u64 {
        self.total - self.empty
    }
}

impl Display for Tally {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} scanned, {} trimmed as blank",
            human_bytes(self.total), human_bytes(self.empty))
    }
}

#[derive(Default)]
pub(crate) struct Classifier {
    tally: Tally,
}

impl Classifier {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns a record for a meaningful chunk, `None` for a blank one. The
    /// record owns a copy as the caller reuses the buffer for the next read.
    pub(crate) fn classify(&mut self, offset: u64, buffer: &ChunkBuffer)
        -> Option<Chunk>
    {
        self.tally.total += CHUNK_SIZE_U64;
        if is_blank(buffer) {
            self.tally.empty += CHUNK_SIZE_U64;
            None
        } else {
            Some(Chunk { offset, data: buffer.to_vec() })
        }
    }

    pub(crate) fn tally(&self) -> Tally {
        self.tally
    }
}
