//! Remembered set of old objects that may point into the young generation.
//!
//! Owners are appended to fixed-capacity blocks. The remembered bit in the
//! owner's header keeps each owner in the buffer at most once, so the buffer
//! itself never deduplicates.

use object::Value;

#[derive(Debug)]
pub struct StoreBufferBlock {
    entries: Vec<Value>,
}

impl StoreBufferBlock {
    fn with_capacity(capacity: usize) -> Self {
        Self { entries: Vec::with_capacity(capacity) }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline(always)]
    pub fn is_full(&self) -> bool {
        self.entries.len() == self.entries.capacity()
    }

    pub fn entries(&self) -> &[Value] {
        &self.entries
    }
}

#[derive(Debug)]
pub struct StoreBuffer {
    block_size: usize,
    current: StoreBufferBlock,
    full_blocks: Vec<StoreBufferBlock>,
}

impl StoreBuffer {
    pub fn new(block_size: usize) -> Self {
        debug_assert!(block_size > 0);
        Self {
            block_size,
            current: StoreBufferBlock::with_capacity(block_size),
            full_blocks: Vec::new(),
        }
    }

    /// Records `owner`. The caller has already set its remembered bit.
    #[inline]
    pub fn add(&mut self, owner: Value) {
        debug_assert!(owner.is_old_object());
        self.current.entries.push(owner);
        if self.current.is_full() {
            self.flush_current();
        }
    }

    #[cold]
    fn flush_current(&mut self) {
        let full = std::mem::replace(
            &mut self.current,
            StoreBufferBlock::with_capacity(self.block_size),
        );
        log::trace!("store buffer block full ({} entries)", full.len());
        self.full_blocks.push(full);
    }

    /// Takes every recorded owner, leaving the buffer empty.
    pub fn drain(&mut self) -> Vec<Value> {
        let mut out = Vec::with_capacity(self.len());
        for block in self.full_blocks.drain(..) {
            out.extend_from_slice(&block.entries);
        }
        out.append(&mut self.current.entries);
        out
    }

    /// Keeps only the owners for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(Value) -> bool) {
        let entries = self.drain();
        for owner in entries {
            if keep(owner) {
                self.add(owner);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.full_blocks.iter().map(StoreBufferBlock::len).sum::<usize>()
            + self.current.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_full_blocks(&self) -> usize {
        self.full_blocks.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = Value> + '_ {
        self.full_blocks
            .iter()
            .flat_map(|b| b.entries.iter().copied())
            .chain(self.current.entries.iter().copied())
    }

    pub fn contains(&self, owner: Value) -> bool {
        self.iter().any(|v| v == owner)
    }

    /// Number of times `owner` appears; at most one while the remembered
    /// bit protocol is respected.
    pub fn count(&self, owner: Value) -> usize {
        self.iter().filter(|&v| v == owner).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn old(n: usize) -> Value {
        Value::from_addr(0x10_0000 + n * 16)
    }

    #[test]
    fn full_block_is_handed_off() {
        let mut sb = StoreBuffer::new(4);
        for i in 0..9 {
            sb.add(old(i));
        }
        assert_eq!(sb.num_full_blocks(), 2);
        assert_eq!(sb.len(), 9);
        assert!(sb.contains(old(8)));
        assert_eq!(sb.count(old(3)), 1);
    }

    #[test]
    fn drain_empties_buffer_in_order() {
        let mut sb = StoreBuffer::new(2);
        for i in 0..5 {
            sb.add(old(i));
        }
        let drained = sb.drain();
        assert_eq!(drained, (0..5).map(old).collect::<Vec<_>>());
        assert!(sb.is_empty());
        assert_eq!(sb.num_full_blocks(), 0);
    }

    #[test]
    fn retain_filters_owners() {
        let mut sb = StoreBuffer::new(3);
        for i in 0..6 {
            sb.add(old(i));
        }
        sb.retain(|v| v != old(2) && v != old(5));
        assert_eq!(sb.len(), 4);
        assert!(!sb.contains(old(2)));
        assert!(sb.contains(old(4)));
    }
}
