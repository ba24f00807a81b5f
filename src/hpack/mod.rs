/* STATIC Proxy (AGPL-3.0)

Copyright (C) 2025 - 404 Contributors

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

*/

//! HPACK (RFC 7541) header-block decompression for the HTTP/2 observer.
//!
//! The decoder is stateful: one instance per connection direction, fed every header
//! block of that direction in arrival order. It only ever decodes; the proxy never
//! re-encodes HTTP/2 traffic.

pub mod huffman;
pub mod table;

pub use table::{DynamicTable, DEFAULT_TABLE_SIZE, STATIC_TABLE};

use bytes::Bytes;
use thiserror::Error;

use crate::http::HeaderField;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HpackError {
    #[error("header block ends in the middle of a representation")]
    Truncated,

    #[error("index 0 is not a valid table index")]
    ZeroIndex,

    #[error("index {index} is past the end of the tables ({available} entries)")]
    IndexOutOfRange { index: usize, available: usize },

    #[error("integer does not fit in 32 bits")]
    IntegerOverflow,

    #[error("dynamic table size update to {requested} exceeds the allowed {allowed}")]
    TableSizeExceeded { requested: usize, allowed: usize },

    #[error("Huffman string contains the EOS symbol")]
    HuffmanEos,

    #[error("invalid Huffman code")]
    InvalidHuffmanCode,

    #[error("invalid Huffman padding")]
    InvalidHuffmanPadding,

    #[error("header name is not valid UTF-8")]
    InvalidHeaderName,
}

#[derive(Debug, Clone)]
pub struct HpackDecoder {
    table: DynamicTable,
    // Ceiling a size update may request; follows SETTINGS_HEADER_TABLE_SIZE.
    max_allowed: usize,
}

impl Default for HpackDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl HpackDecoder {
    pub fn new() -> Self {
        Self::with_max_table_size(DEFAULT_TABLE_SIZE)
    }

    pub fn with_max_table_size(max_size: usize) -> Self {
        Self {
            table: DynamicTable::new(max_size),
            max_allowed: max_size,
        }
    }

    /// Applies a newly negotiated SETTINGS_HEADER_TABLE_SIZE.
    ///
    /// Shrinking below the current table size evicts immediately.
    pub fn set_max_allowed(&mut self, max_allowed: usize) {
        self.max_allowed = max_allowed;
        if self.table.max_size() > max_allowed {
            self.table.set_max_size(max_allowed);
        }
    }

    pub fn max_allowed(&self) -> usize {
        self.max_allowed
    }

    pub fn dynamic_table(&self) -> &DynamicTable {
        &self.table
    }

    /// Decodes one complete header block (HEADERS or PUSH_PROMISE plus CONTINUATIONs).
    pub fn decode(&mut self, block: &[u8]) -> Result<Vec<HeaderField>, HpackError> {
        let mut fields = Vec::new();
        let mut pos = 0;

        while pos < block.len() {
            let first = block[pos];
            if first & 0x80 != 0 {
                let index = decode_integer(block, &mut pos, 7)?;
                fields.push(self.lookup(index)?);
            } else if first & 0xc0 == 0x40 {
                let field = self.decode_literal(block, &mut pos, 6)?;
                self.table.insert(field.clone());
                fields.push(field);
            } else if first & 0xe0 == 0x20 {
                let requested = decode_integer(block, &mut pos, 5)?;
                if requested > self.max_allowed {
                    return Err(HpackError::TableSizeExceeded {
                        requested,
                        allowed: self.max_allowed,
                    });
                }
                self.table.set_max_size(requested);
            } else {
                // 0000 (without indexing) and 0001 (never indexed) share a layout.
                fields.push(self.decode_literal(block, &mut pos, 4)?);
            }
        }

        Ok(fields)
    }

    fn lookup(&self, index: usize) -> Result<HeaderField, HpackError> {
        if index == 0 {
            return Err(HpackError::ZeroIndex);
        }
        if let Some(&(name, value)) = STATIC_TABLE.get(index - 1) {
            return Ok(HeaderField::new(name, Bytes::from_static(value.as_bytes())));
        }
        self.table
            .get(index - STATIC_TABLE.len() - 1)
            .cloned()
            .ok_or(HpackError::IndexOutOfRange {
                index,
                available: STATIC_TABLE.len() + self.table.len(),
            })
    }

    fn decode_literal(
        &self,
        block: &[u8],
        pos: &mut usize,
        prefix_bits: u8,
    ) -> Result<HeaderField, HpackError> {
        let name_index = decode_integer(block, pos, prefix_bits)?;
        let name = if name_index == 0 {
            let raw = decode_string(block, pos)?;
            String::from_utf8(raw).map_err(|_| HpackError::InvalidHeaderName)?
        } else {
            self.lookup(name_index)?.name
        };
        let value = decode_string(block, pos)?;
        Ok(HeaderField::new(name, value))
    }
}

/// Decodes an N-bit prefix integer starting at `*pos` and advances past it.
pub fn decode_integer(block: &[u8], pos: &mut usize, prefix_bits: u8) -> Result<usize, HpackError> {
    let first = *block.get(*pos).ok_or(HpackError::Truncated)?;
    *pos += 1;

    let max_prefix = (1u32 << prefix_bits) - 1;
    let mut value = u32::from(first) & max_prefix;
    if value < max_prefix {
        return Ok(value as usize);
    }

    let mut shift = 0u32;
    loop {
        let byte = *block.get(*pos).ok_or(HpackError::Truncated)?;
        *pos += 1;
        let chunk = u32::from(byte & 0x7f);
        if shift > 28 || (shift == 28 && chunk > 0x0f) {
            return Err(HpackError::IntegerOverflow);
        }
        value = value
            .checked_add(chunk << shift)
            .ok_or(HpackError::IntegerOverflow)?;
        if byte & 0x80 == 0 {
            return Ok(value as usize);
        }
        shift += 7;
    }
}

fn decode_string(block: &[u8], pos: &mut usize) -> Result<Vec<u8>, HpackError> {
    let huffman = block.get(*pos).ok_or(HpackError::Truncated)? & 0x80 != 0;
    let len = decode_integer(block, pos, 7)?;
    let end = pos.checked_add(len).ok_or(HpackError::Truncated)?;
    let raw = block.get(*pos..end).ok_or(HpackError::Truncated)?;
    *pos = end;
    if huffman {
        huffman::decode(raw)
    } else {
        Ok(raw.to_vec())
    }
}
