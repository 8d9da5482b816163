//! Bit-string + reference tree used for every on-chain payload.
//!
//! A [`Cell`] is immutable once built. Use [`CellBuilder`] to assemble one and
//! [`Slice`] to read it back. Conversion to and from the wire lives in [`boc`].

use sha2::{
    Digest,
    Sha256,
};
use std::{
    fmt,
    sync::Arc,
};

pub mod boc;


pub const MAX_BITS: usize = 1023;
pub const MAX_REFS: usize = 4;
pub const MAX_DEPTH: u16 = 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CellError {
    #[error("cell capacity exceeded: need {bits} bits / {refs} refs (max 1023 / 4)")]
    CapacityExceeded { bits: usize, refs: usize },
    #[error("cell depth {depth} exceeds the maximum of 1024")]
    DepthExceeded { depth: u16 },
    #[error("slice underrun: requested {requested}, {available} available")]
    SliceUnderrun { requested: usize, available: usize },
    #[error("value {value} does not fit in {bits} bits")]
    ValueOutOfRange { value: u64, bits: usize },
    #[error("invalid string tail: {0}")]
    InvalidString(String),
}

#[derive(Clone, PartialEq, Eq)]
pub struct Cell {
    data: Vec<u8>,
    bit_len: usize,
    refs: Vec<Arc<Cell>>,
    depth: u16,
    hash: [u8; 32],
}

impl Cell {
    pub fn builder() -> CellBuilder {
        CellBuilder::default()
    }

    pub fn empty() -> Self {
        Self::from_parts(Vec::new(), 0, Vec::new())
    }

    /// Caller guarantees `data.len() == ceil(bit_len / 8)`; trailing bits are cleared.
    fn from_parts(mut data: Vec<u8>, bit_len: usize, refs: Vec<Arc<Cell>>) -> Self {
        debug_assert_eq!(data.len(), bit_len.div_ceil(8));
        if bit_len % 8 != 0 {
            if let Some(last) = data.last_mut() {
                *last &= 0xffu8 << (8 - bit_len % 8);
            }
        }
        let depth = refs
            .iter()
            .map(|child| child.depth.saturating_add(1))
            .max()
            .unwrap_or(0);
        let mut cell = Self {
            data,
            bit_len,
            refs,
            depth,
            hash: [0u8; 32],
        };
        cell.hash = cell.representation_hash();
        cell
    }

    pub fn parse(&self) -> Slice<'_> {
        Slice {
            cell: self,
            bit_pos: 0,
            ref_pos: 0,
        }
    }

    pub fn bit_len(&self) -> usize {
        self.bit_len
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn refs(&self) -> impl ExactSizeIterator<Item = &Cell> {
        self.refs.iter().map(|r| r.as_ref())
    }

    pub fn depth(&self) -> u16 {
        self.depth
    }

    pub fn hash(&self) -> [u8; 32] {
        self.hash
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }

    pub(crate) fn descriptors(&self) -> [u8; 2] {
        let d1 = self.refs.len() as u8;
        let d2 = (self.bit_len / 8 + self.bit_len.div_ceil(8)) as u8;
        [d1, d2]
    }

    /// Data bytes with the completion tag appended when the length is not byte aligned.
    pub(crate) fn padded_data(&self) -> Vec<u8> {
        let mut out = self.data.clone();
        let rem = self.bit_len % 8;
        if rem != 0 {
            if let Some(last) = out.last_mut() {
                *last |= 0x80 >> rem;
            }
        }
        out
    }

    fn representation_hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.descriptors());
        hasher.update(self.padded_data());
        for child in &self.refs {
            hasher.update(child.depth.to_be_bytes());
        }
        for child in &self.refs {
            hasher.update(child.hash);
        }
        hasher.finalize().into()
    }

    fn bit_at(&self, index: usize) -> bool {
        self.data[index / 8] & (0x80 >> (index % 8)) != 0
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_indented(f, 0)
    }
}

impl fmt::Debug for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Cell {
    fn fmt_indented(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        let mut text = hex::encode_upper(self.padded_data());
        let rem = self.bit_len % 8;
        if rem != 0 {
            // the tag nibble is dropped when it carries no data bits
            if rem <= 4 {
                text.pop();
            }
            if rem != 4 {
                text.push('_');
            }
        }
        writeln!(f, "{:indent$}x{{{text}}}", "", indent = indent)?;
        for child in &self.refs {
            child.fmt_indented(f, indent + 1)?;
        }
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct CellBuilder {
    data: Vec<u8>,
    bit_len: usize,
    refs: Vec<Arc<Cell>>,
}

impl CellBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bits_left(&self) -> usize {
        MAX_BITS - self.bit_len
    }

    pub fn refs_left(&self) -> usize {
        MAX_REFS - self.refs.len()
    }

    fn ensure_bits(&self, bits: usize) -> Result<(), CellError> {
        if self.bit_len + bits > MAX_BITS {
            return Err(CellError::CapacityExceeded {
                bits: self.bit_len + bits,
                refs: self.refs.len(),
            });
        }
        Ok(())
    }

    fn push_bit(&mut self, bit: bool) {
        if self.bit_len % 8 == 0 {
            self.data.push(0);
        }
        if bit {
            let last = self.data.len() - 1;
            self.data[last] |= 0x80 >> (self.bit_len % 8);
        }
        self.bit_len += 1;
    }

    pub fn store_bit(&mut self, bit: bool) -> Result<&mut Self, CellError> {
        self.ensure_bits(1)?;
        self.push_bit(bit);
        Ok(self)
    }

    pub fn store_uint(&mut self, value: u64, bits: usize) -> Result<&mut Self, CellError> {
        if bits > 64 || (bits < 64 && value >> bits != 0) {
            return Err(CellError::ValueOutOfRange { value, bits });
        }
        self.ensure_bits(bits)?;
        for i in (0..bits).rev() {
            self.push_bit((value >> i) & 1 == 1);
        }
        Ok(self)
    }

    pub fn store_bytes(&mut self, bytes: &[u8]) -> Result<&mut Self, CellError> {
        self.ensure_bits(bytes.len() * 8)?;
        if self.bit_len % 8 == 0 {
            self.data.extend_from_slice(bytes);
            self.bit_len += bytes.len() * 8;
        } else {
            for byte in bytes {
                for i in (0..8).rev() {
                    self.push_bit((byte >> i) & 1 == 1);
                }
            }
        }
        Ok(self)
    }

    pub fn store_ref(&mut self, cell: Cell) -> Result<&mut Self, CellError> {
        if cell.depth >= MAX_DEPTH {
            return Err(CellError::DepthExceeded {
                depth: cell.depth.saturating_add(1),
            });
        }
        if self.refs.len() >= MAX_REFS {
            return Err(CellError::CapacityExceeded {
                bits: self.bit_len,
                refs: self.refs.len() + 1,
            });
        }
        self.refs.push(Arc::new(cell));
        Ok(self)
    }

    /// Stores `text` as a snake string: as many whole bytes as fit here, the rest
    /// chained through the first reference of each following cell.
    pub fn store_string_tail(&mut self, text: &str) -> Result<&mut Self, CellError> {
        let bytes = text.as_bytes();
        let here = (self.bits_left() / 8).min(bytes.len());
        let (head, rest) = bytes.split_at(here);
        if !rest.is_empty() && self.refs_left() == 0 {
            return Err(CellError::CapacityExceeded {
                bits: self.bit_len + bytes.len() * 8,
                refs: self.refs.len() + 1,
            });
        }
        self.store_bytes(head)?;
        if !rest.is_empty() {
            self.store_ref(snake_chain(rest)?)?;
        }
        Ok(self)
    }

    pub fn build(&self) -> Cell {
        Cell::from_parts(self.data.clone(), self.bit_len, self.refs.clone())
    }
}

fn snake_chain(bytes: &[u8]) -> Result<Cell, CellError> {
    const CHUNK: usize = MAX_BITS / 8;
    let mut chunks: Vec<&[u8]> = bytes.chunks(CHUNK).collect();
    let mut tail: Option<Cell> = None;
    while let Some(chunk) = chunks.pop() {
        let mut builder = CellBuilder::new();
        builder.store_bytes(chunk)?;
        if let Some(next) = tail.take() {
            builder.store_ref(next)?;
        }
        tail = Some(builder.build());
    }
    Ok(tail.unwrap_or_else(Cell::empty))
}

pub struct Slice<'a> {
    cell: &'a Cell,
    bit_pos: usize,
    ref_pos: usize,
}

impl<'a> Slice<'a> {
    pub fn remaining_bits(&self) -> usize {
        self.cell.bit_len - self.bit_pos
    }

    pub fn remaining_refs(&self) -> usize {
        self.cell.refs.len() - self.ref_pos
    }

    fn ensure_bits(&self, bits: usize) -> Result<(), CellError> {
        if bits > self.remaining_bits() {
            return Err(CellError::SliceUnderrun {
                requested: bits,
                available: self.remaining_bits(),
            });
        }
        Ok(())
    }

    pub fn load_bit(&mut self) -> Result<bool, CellError> {
        self.ensure_bits(1)?;
        let bit = self.cell.bit_at(self.bit_pos);
        self.bit_pos += 1;
        Ok(bit)
    }

    pub fn load_uint(&mut self, bits: usize) -> Result<u64, CellError> {
        if bits > 64 {
            return Err(CellError::ValueOutOfRange { value: 0, bits });
        }
        self.ensure_bits(bits)?;
        let mut value = 0u64;
        for _ in 0..bits {
            value = (value << 1) | u64::from(self.cell.bit_at(self.bit_pos));
            self.bit_pos += 1;
        }
        Ok(value)
    }

    /// Reads `bits` without moving the cursor.
    pub fn preload_uint(&self, bits: usize) -> Result<u64, CellError> {
        let mut probe = Slice {
            cell: self.cell,
            bit_pos: self.bit_pos,
            ref_pos: self.ref_pos,
        };
        probe.load_uint(bits)
    }

    pub fn skip_bits(&mut self, bits: usize) -> Result<(), CellError> {
        self.ensure_bits(bits)?;
        self.bit_pos += bits;
        Ok(())
    }

    pub fn load_bytes(&mut self, len: usize) -> Result<Vec<u8>, CellError> {
        self.ensure_bits(len * 8)?;
        if self.bit_pos % 8 == 0 {
            let start = self.bit_pos / 8;
            self.bit_pos += len * 8;
            return Ok(self.cell.data[start..start + len].to_vec());
        }
        (0..len)
            .map(|_| self.load_uint(8).map(|b| b as u8))
            .collect()
    }

    pub fn load_ref(&mut self) -> Result<&'a Cell, CellError> {
        let cell: &'a Cell = self.cell;
        let child = cell.refs.get(self.ref_pos).ok_or(CellError::SliceUnderrun {
            requested: 1,
            available: 0,
        })?;
        self.ref_pos += 1;
        Ok(child.as_ref())
    }

    /// Reads the rest of this slice plus its snake continuation as UTF-8.
    pub fn load_string_tail(&mut self) -> Result<String, CellError> {
        let mut bytes = Vec::new();
        read_snake_bytes(self, &mut bytes)?;
        String::from_utf8(bytes).map_err(|e| CellError::InvalidString(e.to_string()))
    }

    /// `None` when no presence bit is left or it is unset.
    pub fn load_maybe_string_tail(&mut self) -> Result<Option<String>, CellError> {
        if self.remaining_bits() == 0 {
            return Ok(None);
        }
        if !self.load_bit()? {
            return Ok(None);
        }
        self.load_string_tail().map(Some)
    }
}

fn read_snake_bytes(slice: &mut Slice<'_>, out: &mut Vec<u8>) -> Result<(), CellError> {
    let mut current = Slice {
        cell: slice.cell,
        bit_pos: slice.bit_pos,
        ref_pos: slice.ref_pos,
    };
    loop {
        if current.remaining_bits() % 8 != 0 {
            return Err(CellError::InvalidString(format!(
                "{} bits is not a whole number of bytes",
                current.remaining_bits()
            )));
        }
        let bytes = current.load_bytes(current.remaining_bits() / 8)?;
        out.extend_from_slice(&bytes);
        match current.remaining_refs() {
            0 => break,
            1 => current = current.load_ref()?.parse(),
            n => {
                return Err(CellError::InvalidString(format!(
                    "string continuation has {n} refs"
                )));
            }
        }
    }
    slice.bit_pos = slice.cell.bit_len;
    slice.ref_pos = slice.cell.refs.len();
    Ok(())
}
