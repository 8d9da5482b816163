// Bag-of-cells wire encoding: the only place network bytes become a `Cell` tree.
use super::{
    Cell,
    MAX_DEPTH,
};
use base64::{
    Engine as _,
    engine::general_purpose::{
        STANDARD,
        URL_SAFE,
    },
};
use std::{
    collections::HashMap,
    sync::Arc,
};

const BOC_MAGIC: [u8; 4] = [0xb5, 0xee, 0x9c, 0x72];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BocError {
    #[error("invalid base64: {0}")]
    Base64(String),
    #[error("unknown boc magic {0:02x?}")]
    BadMagic([u8; 4]),
    #[error("boc truncated while reading {0}")]
    Truncated(&'static str),
    #[error("boc has {0} roots, expected at least one")]
    NoRoots(usize),
    #[error("cell {cell} references index {target}")]
    BadRefIndex { cell: usize, target: usize },
    #[error("crc32c mismatch: stored {stored:08x}, computed {computed:08x}")]
    CrcMismatch { stored: u32, computed: u32 },
    #[error("unsupported cell: {0}")]
    Unsupported(String),
}

impl Cell {
    pub fn to_boc(&self) -> Vec<u8> {
        serialize(self)
    }

    pub fn to_boc_base64(&self) -> String {
        STANDARD.encode(serialize(self))
    }

    pub fn from_boc(bytes: &[u8]) -> Result<Cell, BocError> {
        deserialize(bytes)
    }

    /// Accepts both the standard and the url-safe alphabet.
    pub fn from_boc_base64(text: &str) -> Result<Cell, BocError> {
        let trimmed = text.trim();
        let bytes = STANDARD
            .decode(trimmed)
            .or_else(|_| URL_SAFE.decode(trimmed))
            .map_err(|e| BocError::Base64(e.to_string()))?;
        deserialize(&bytes)
    }
}

/// Parents come before children; identical subtrees are stored once.
fn topological_order(root: &Cell) -> Vec<&Cell> {
    fn visit<'a>(
        cell: &'a Cell,
        seen: &mut HashMap<[u8; 32], ()>,
        post_order: &mut Vec<&'a Cell>,
    ) {
        if seen.insert(cell.hash(), ()).is_some() {
            return;
        }
        for child in cell.refs() {
            visit(child, seen, post_order);
        }
        post_order.push(cell);
    }

    let mut seen = HashMap::new();
    let mut order = Vec::new();
    visit(root, &mut seen, &mut order);
    order.reverse();
    order
}

fn bytes_needed(value: usize) -> usize {
    let mut n = 1;
    while n < 8 && value >> (n * 8) != 0 {
        n += 1;
    }
    n
}

fn write_be(out: &mut Vec<u8>, value: usize, width: usize) {
    for i in (0..width).rev() {
        out.push((value >> (i * 8)) as u8);
    }
}

pub fn serialize(root: &Cell) -> Vec<u8> {
    let order = topological_order(root);
    let index: HashMap<[u8; 32], usize> = order
        .iter()
        .enumerate()
        .map(|(i, cell)| (cell.hash(), i))
        .collect();
    let size_bytes = bytes_needed(order.len());

    let mut cells_blob = Vec::new();
    for cell in &order {
        cells_blob.extend_from_slice(&cell.descriptors());
        cells_blob.extend_from_slice(&cell.padded_data());
        for child in cell.refs() {
            write_be(&mut cells_blob, index[&child.hash()], size_bytes);
        }
    }
    let off_bytes = bytes_needed(cells_blob.len());

    let mut out = Vec::with_capacity(cells_blob.len() + 32);
    out.extend_from_slice(&BOC_MAGIC);
    // has_idx = 0, has_crc32c = 1, has_cache_bits = 0, flags = 0
    out.push(0x40 | size_bytes as u8);
    out.push(off_bytes as u8);
    write_be(&mut out, order.len(), size_bytes);
    write_be(&mut out, 1, size_bytes);
    write_be(&mut out, 0, size_bytes);
    write_be(&mut out, cells_blob.len(), off_bytes);
    write_be(&mut out, 0, size_bytes);
    out.extend_from_slice(&cells_blob);
    let crc = crc32c(&out);
    out.extend_from_slice(&crc.to_le_bytes());
    out
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize, what: &'static str) -> Result<&'a [u8], BocError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(BocError::Truncated(what))?;
        let chunk = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(chunk)
    }

    fn byte(&mut self, what: &'static str) -> Result<u8, BocError> {
        Ok(self.take(1, what)?[0])
    }

    fn uint(&mut self, width: usize, what: &'static str) -> Result<usize, BocError> {
        Ok(self
            .take(width, what)?
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | *b as usize))
    }
}

struct RawCell {
    data: Vec<u8>,
    bit_len: usize,
    refs: Vec<usize>,
}

/// Returns the first root.
pub fn deserialize(bytes: &[u8]) -> Result<Cell, BocError> {
    let mut reader = Reader { bytes, pos: 0 };
    let magic: [u8; 4] = reader
        .take(4, "magic")?
        .try_into()
        .map_err(|_| BocError::Truncated("magic"))?;
    if magic != BOC_MAGIC {
        return Err(BocError::BadMagic(magic));
    }
    let flags = reader.byte("flags")?;
    let has_idx = flags & 0x80 != 0;
    let has_crc = flags & 0x40 != 0;
    let size_bytes = (flags & 0x07) as usize;
    if size_bytes == 0 || size_bytes > 4 {
        return Err(BocError::Unsupported(format!("ref size {size_bytes}")));
    }
    let off_bytes = reader.byte("offset size")? as usize;
    if off_bytes == 0 || off_bytes > 8 {
        return Err(BocError::Unsupported(format!("offset size {off_bytes}")));
    }
    let cell_count = reader.uint(size_bytes, "cell count")?;
    let root_count = reader.uint(size_bytes, "root count")?;
    let _absent = reader.uint(size_bytes, "absent count")?;
    let _total_size = reader.uint(off_bytes, "total cells size")?;
    if root_count == 0 {
        return Err(BocError::NoRoots(root_count));
    }
    if cell_count > bytes.len() || root_count > cell_count {
        return Err(BocError::Truncated("cell table"));
    }
    let mut roots = Vec::with_capacity(root_count.min(cell_count));
    for _ in 0..root_count {
        roots.push(reader.uint(size_bytes, "root index")?);
    }
    if has_idx {
        reader.take(cell_count * off_bytes, "index")?;
    }

    let mut raw = Vec::with_capacity(cell_count.min(bytes.len()));
    for i in 0..cell_count {
        raw.push(read_raw_cell(&mut reader, i, cell_count, size_bytes)?);
    }

    if has_crc {
        let body_end = reader.pos;
        let stored = u32::from_le_bytes(
            reader
                .take(4, "crc32c")?
                .try_into()
                .map_err(|_| BocError::Truncated("crc32c"))?,
        );
        let computed = crc32c(&bytes[..body_end]);
        if stored != computed {
            return Err(BocError::CrcMismatch { stored, computed });
        }
    }

    // children always have larger indices, so build back to front
    let mut built: Vec<Option<Arc<Cell>>> = vec![None; cell_count];
    for (i, cell) in raw.into_iter().enumerate().rev() {
        let refs = cell
            .refs
            .iter()
            .map(|&r| {
                built[r]
                    .clone()
                    .ok_or(BocError::BadRefIndex { cell: i, target: r })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let cell = Cell::from_parts(cell.data, cell.bit_len, refs);
        if cell.depth() > MAX_DEPTH {
            return Err(BocError::Unsupported(format!(
                "cell {i} is deeper than {MAX_DEPTH}"
            )));
        }
        built[i] = Some(Arc::new(cell));
    }

    let root = roots[0];
    built
        .get(root)
        .cloned()
        .flatten()
        .map(Arc::unwrap_or_clone)
        .ok_or(BocError::BadRefIndex {
            cell: 0,
            target: root,
        })
}

fn read_raw_cell(
    reader: &mut Reader<'_>,
    index: usize,
    cell_count: usize,
    size_bytes: usize,
) -> Result<RawCell, BocError> {
    let d1 = reader.byte("cell descriptor")?;
    let d2 = reader.byte("cell descriptor")?;
    let ref_count = (d1 & 0x07) as usize;
    if ref_count > super::MAX_REFS {
        return Err(BocError::Unsupported(format!("{ref_count} refs")));
    }
    if d1 & 0x08 != 0 {
        return Err(BocError::Unsupported("exotic cell".to_string()));
    }
    if d1 & 0x10 != 0 {
        let level = (d1 >> 5) as usize;
        reader.take((level + 1) * (32 + 2), "stored hashes")?;
    }
    let data_len = (d2 as usize).div_ceil(2);
    let mut data = reader.take(data_len, "cell data")?.to_vec();
    let bit_len = if d2 % 2 == 1 {
        let last = data.last().copied().unwrap_or(0);
        if last == 0 {
            return Err(BocError::Unsupported("missing completion tag".to_string()));
        }
        let tag = last.trailing_zeros() as usize;
        if let Some(byte) = data.last_mut() {
            *byte &= !(1u8 << tag);
        }
        (data_len - 1) * 8 + (7 - tag)
    } else {
        data_len * 8
    };
    if bit_len > super::MAX_BITS {
        return Err(BocError::Unsupported(format!("{bit_len} bits")));
    }
    let mut refs = Vec::with_capacity(ref_count);
    for _ in 0..ref_count {
        let target = reader.uint(size_bytes, "cell ref")?;
        if target <= index || target >= cell_count {
            return Err(BocError::BadRefIndex {
                cell: index,
                target,
            });
        }
        refs.push(target);
    }
    Ok(RawCell {
        data,
        bit_len,
        refs,
    })
}

/// CRC-32C (Castagnoli), reflected.
pub(crate) fn crc32c(bytes: &[u8]) -> u32 {
    let mut crc = !0u32;
    for byte in bytes {
        crc ^= u32::from(*byte);
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0x82f6_3b78 & mask);
        }
    }
    !crc
}
