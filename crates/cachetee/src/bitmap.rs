use cachetee_core::{TeeError, TeeErrorKind, TeeResult};

/// One presence bit per cached block.
///
/// Bit `i` lives in bit `i % 8` of byte `i / 8`. Padding bits past `len` in the final byte are
/// always zero, both in memory and in the serialized form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockBitmap {
    bits: Vec<u8>,
    len: u64,
    set_count: u64,
}

impl BlockBitmap {
    /// All-unset bitmap for `block_count` blocks.
    pub fn new(block_count: u64) -> Self {
        Self {
            bits: vec![0u8; Self::byte_len(block_count)],
            len: block_count,
            set_count: 0,
        }
    }

    /// Serialized size in bytes for `block_count` blocks.
    pub fn byte_len(block_count: u64) -> usize {
        block_count.div_ceil(8) as usize
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn count_set(&self) -> u64 {
        self.set_count
    }

    pub fn is_full(&self) -> bool {
        self.set_count == self.len
    }

    /// # Panics
    ///
    /// Panics if `block` is out of range.
    pub fn is_set(&self, block: u64) -> bool {
        self.check_index(block);
        self.bits[(block / 8) as usize] & (1u8 << (block % 8)) != 0
    }

    /// Mark one block present. Returns `true` if the bit was previously unset.
    ///
    /// # Panics
    ///
    /// Panics if `block` is out of range.
    pub fn set(&mut self, block: u64) -> bool {
        self.set_range(block, 1) == 1
    }

    /// Set `count` bits starting at `start`, returning how many were newly set.
    pub fn set_range(&mut self, start: u64, count: u64) -> u64 {
        self.check_range(start, count);
        let newly_set = update_bits(&mut self.bits, start, count, true);
        self.set_count += newly_set;
        newly_set
    }

    /// Clear `count` bits starting at `start`, returning how many were previously set.
    pub fn clear_range(&mut self, start: u64, count: u64) -> u64 {
        self.check_range(start, count);
        let removed = update_bits(&mut self.bits, start, count, false);
        self.set_count -= removed;
        removed
    }

    /// Length of the run of bits equal to `value` starting at `start`, stopping at `end`.
    pub fn run_len(&self, start: u64, end: u64, value: bool) -> u64 {
        let end = end.min(self.len);
        let skip = if value { u8::MAX } else { 0 };
        let mut idx = start;
        while idx < end {
            if idx % 8 == 0 && end - idx >= 8 && self.bits[(idx / 8) as usize] == skip {
                idx += 8;
                continue;
            }
            if self.is_set(idx) != value {
                break;
            }
            idx += 1;
        }
        idx.saturating_sub(start)
    }

    /// Byte offset and raw bytes holding the bits of blocks `[start, end)`.
    pub fn byte_span(&self, start: u64, end: u64) -> (usize, &[u8]) {
        if start >= end {
            return (0, &[]);
        }
        self.check_range(start, end - start);
        let first = (start / 8) as usize;
        let last = ((end - 1) / 8) as usize;
        (first, &self.bits[first..=last])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn serialize(&self) -> Vec<u8> {
        self.bits.clone()
    }

    /// Rebuild a bitmap from its serialized form.
    ///
    /// Fails with [`TeeErrorKind::InvalidCacheFormat`] when the byte length does not match
    /// `block_count` or when padding bits past the last block are set.
    pub fn deserialize(bytes: &[u8], block_count: u64) -> TeeResult<Self> {
        let expected = Self::byte_len(block_count);
        if bytes.len() != expected {
            return Err(TeeError::with_message(
                TeeErrorKind::InvalidCacheFormat,
                format!(
                    "bitmap length {} does not match {expected} bytes for {block_count} blocks",
                    bytes.len()
                ),
            ));
        }
        let tail_bits = (block_count % 8) as u8;
        if tail_bits != 0 {
            let padding = !((1u8 << tail_bits) - 1);
            if bytes[expected - 1] & padding != 0 {
                return Err(TeeError::with_message(
                    TeeErrorKind::InvalidCacheFormat,
                    "bitmap has bits set past the last block",
                ));
            }
        }
        let set_count = bytes.iter().map(|byte| byte.count_ones() as u64).sum();
        Ok(Self {
            bits: bytes.to_vec(),
            len: block_count,
            set_count,
        })
    }

    fn check_index(&self, block: u64) {
        assert!(
            block < self.len,
            "block index {block} out of range for {} blocks",
            self.len
        );
    }

    fn check_range(&self, start: u64, count: u64) {
        let end = start.checked_add(count);
        assert!(
            end.is_some_and(|end| end <= self.len),
            "block range {start}+{count} out of range for {} blocks",
            self.len
        );
    }
}

fn bit_mask(start_bit: u8, end_bit: u8) -> u8 {
    let width = (end_bit - start_bit + 1) as u16;
    let ones = if width >= 8 {
        u16::from(u8::MAX)
    } else {
        (1u16 << width) - 1
    };
    (ones as u8) << start_bit
}

fn update_bits(bits: &mut [u8], start: u64, len: u64, value: bool) -> u64 {
    let mut idx = start;
    let end = start + len;
    let mut changed = 0u64;
    while idx < end {
        let byte_idx = (idx / 8) as usize;
        let start_bit = (idx % 8) as u8;
        let span = ((8 - start_bit as u64).min(end - idx)) as u8;
        let mask = bit_mask(start_bit, start_bit + span - 1);
        let before = bits[byte_idx];
        let after = if value { before | mask } else { before & !mask };
        bits[byte_idx] = after;
        changed += (before ^ after).count_ones() as u64;
        idx += span as u64;
    }
    changed
}
