// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Byte-range arithmetic: splitting an object into parts and mapping a part
//! onto the fixed-size chunks the backend serves.

use std::ops::Range;

use serde::{Deserialize, Serialize};

/// A contiguous byte range of the object, downloaded as one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartSpec {
    /// Index of this part (0-based)
    pub index: usize,
    /// Start byte position (inclusive)
    pub start: u64,
    /// End byte position (inclusive)
    pub end:   u64,
}

impl PartSpec {
    #[must_use]
    pub const fn len(&self) -> u64 { self.end - self.start + 1 }

    #[must_use]
    pub const fn is_empty(&self) -> bool { false }
}

/// Split `[0, total_size)` into `num_parts` contiguous parts.
///
/// Every part but the last has `total_size / num_parts` bytes; the last one
/// absorbs the remainder. Returns no parts for an empty object, and never
/// more parts than bytes.
#[must_use]
pub fn partition(total_size: u64, num_parts: usize) -> Vec<PartSpec> {
    if num_parts == 0 || total_size == 0 {
        return Vec::new();
    }

    let num_parts = (num_parts as u64).min(total_size);
    let part_size = total_size / num_parts;

    (0..num_parts)
        .map(|i| {
            let start = i * part_size;
            let end = if i == num_parts - 1 {
                total_size - 1
            } else {
                start + part_size - 1
            };
            #[allow(clippy::cast_possible_truncation)]
            PartSpec {
                index: i as usize,
                start,
                end,
            }
        })
        .collect()
}

/// Number of parts to use for an object.
///
/// Objects smaller than `min_part_size` are fetched as a single part;
/// otherwise the requested count is capped so that no part is smaller than
/// `min_part_size`.
#[must_use]
pub fn plan_part_count(total_size: u64, requested: usize, min_part_size: u64) -> usize {
    let requested = requested.max(1);
    if min_part_size == 0 {
        return requested;
    }
    if total_size < min_part_size {
        return 1;
    }
    let by_size = usize::try_from(total_size / min_part_size).unwrap_or(usize::MAX);
    requested.min(by_size.max(1))
}

/// How one part maps onto backend chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    chunk_size:     u64,
    /// Offset of the first chunk to request, a multiple of `chunk_size`.
    pub aligned_offset: u64,
    /// Bytes to drop from the front of the first chunk.
    pub first_cut:      u64,
    /// Bytes to keep from the last chunk.
    pub last_cut:       u64,
    /// Number of chunks covering the part.
    pub chunk_count:    u64,
}

impl ChunkPlan {
    /// Plan the chunks covering `[start, end]` (inclusive).
    ///
    /// # Panics
    ///
    /// Panics if `chunk_size` is zero or `start > end`.
    #[must_use]
    pub fn new(chunk_size: u64, start: u64, end: u64) -> Self {
        assert!(chunk_size > 0, "chunk size must be positive");
        assert!(start <= end, "range start {start} is past its end {end}");

        let aligned_offset = start - start % chunk_size;
        let first_cut = start - aligned_offset;
        let last_cut = end % chunk_size + 1;
        let chunk_count = (end + 1).div_ceil(chunk_size) - aligned_offset / chunk_size;

        Self {
            chunk_size,
            aligned_offset,
            first_cut,
            last_cut,
            chunk_count,
        }
    }

    #[must_use]
    pub fn for_part(chunk_size: u64, part: &PartSpec) -> Self {
        Self::new(chunk_size, part.start, part.end)
    }

    #[must_use]
    pub const fn chunk_size(&self) -> u64 { self.chunk_size }

    /// Backend offset of chunk `i` (0-based).
    #[must_use]
    pub const fn offset_of(&self, i: u64) -> u64 { self.aligned_offset + i * self.chunk_size }

    /// The bytes of chunk `i` that belong to the range.
    ///
    /// Cuts are clamped to the chunk length, so a chunk shorter than
    /// expected yields what it has instead of panicking.
    #[must_use]
    pub fn trim<'a>(&self, i: u64, chunk: &'a [u8]) -> &'a [u8] { &chunk[self.trim_range(i, chunk.len())] }

    /// Range of a chunk of length `len` that [`trim`](Self::trim) keeps.
    #[must_use]
    pub fn trim_range(&self, i: u64, len: usize) -> Range<usize> {
        let from = if i == 0 { clamp(self.first_cut, len) } else { 0 };
        let to = if i + 1 == self.chunk_count {
            clamp(self.last_cut, len)
        } else {
            len
        };
        if from >= to { 0..0 } else { from..to }
    }
}

fn clamp(cut: u64, len: usize) -> usize { usize::try_from(cut).map_or(len, |cut| cut.min(len)) }
