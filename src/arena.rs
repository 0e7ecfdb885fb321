// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Bump allocator scoped to one request cycle

use std::cell::RefCell;

struct Block {
    buf: Box<[u8]>,
    used: usize,
}

impl Block {
    fn new(size: usize) -> Self {
        Block {
            buf: vec![0; size].into_boxed_slice(),
            used: 0,
        }
    }
}

/// A bump allocator whose loans live until [`Arena::reset`].
///
/// Allocation takes `&self`, so request data can borrow from the arena while
/// the connection continues to hand out loans. `reset` takes `&mut self`:
/// the borrow checker statically guarantees that no loan survives the reset,
/// which is the reclamation point between requests on a keep-alive
/// connection.
pub struct Arena {
    blocks: RefCell<Vec<Block>>,
    block_size: usize,
}

impl Arena {
    /// Creates an arena with one block of `block_size` bytes.
    pub fn new(block_size: usize) -> Self {
        Arena {
            blocks: RefCell::new(vec![Block::new(block_size)]),
            block_size,
        }
    }

    /// Copies `bytes` into the arena and returns the stored copy.
    pub fn alloc_bytes(&self, bytes: &[u8]) -> &[u8] {
        let mut blocks = self.blocks.borrow_mut();

        let need = bytes.len();
        if blocks.last().map(|b| b.buf.len() - b.used).unwrap_or(0) < need {
            blocks.push(Block::new(self.block_size.max(need)));
        }

        let block = blocks.last_mut().expect("arena always holds a block");
        let start = block.used;
        block.buf[start..start + need].copy_from_slice(bytes);
        block.used += need;

        let ptr = block.buf[start..].as_ptr();

        // Safety: blocks are boxed slices that are never freed, shrunk, or
        // moved until `reset` or drop, both of which require exclusive
        // access to the arena and therefore cannot overlap this loan. The
        // region [start, start+need) was just initialized and will not be
        // handed out again: `used` only grows between resets.
        unsafe { std::slice::from_raw_parts(ptr, need) }
    }

    /// Copies `s` into the arena and returns the stored copy.
    pub fn alloc_str(&self, s: &str) -> &str {
        let bytes = self.alloc_bytes(s.as_bytes());

        // Safety: `bytes` is a verbatim copy of a valid UTF-8 string.
        unsafe { std::str::from_utf8_unchecked(bytes) }
    }

    /// Rewinds to a single empty block, freeing any overflow blocks. This is
    /// the per-request reclamation; O(blocks allocated beyond the first).
    pub fn reset(&mut self) {
        let blocks = self.blocks.get_mut();
        blocks.truncate(1);
        blocks[0].used = 0;
    }

    /// Bytes handed out since the last reset.
    pub fn used(&self) -> usize {
        self.blocks.borrow().iter().map(|b| b.used).sum()
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("block_size", &self.block_size)
            .field("blocks", &self.blocks.borrow().len())
            .field("used", &self.used())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::Arena;

    #[test]
    fn arena_alloc_returns_stored_copy() {
        let arena = Arena::new(64);
        let s = arena.alloc_str("/index.html");
        assert_eq!("/index.html", s);
        assert_eq!(11, arena.used());
    }

    #[test]
    fn arena_loans_stay_valid_across_further_allocs() {
        let arena = Arena::new(16);
        let a = arena.alloc_bytes(b"first");
        // forces an overflow block
        let b = arena.alloc_bytes(&[0x42; 64]);
        let c = arena.alloc_str("third");
        assert_eq!(b"first", a);
        assert_eq!(64, b.len());
        assert_eq!("third", c);
    }

    #[test]
    fn arena_reset_rewinds_to_single_block() {
        let mut arena = Arena::new(8);
        arena.alloc_bytes(&[1; 32]);
        arena.alloc_bytes(&[2; 32]);
        assert!(arena.used() > 0);
        arena.reset();
        assert_eq!(0, arena.used());
        // capacity of the first block is retained and reusable
        let s = arena.alloc_str("again");
        assert_eq!("again", s);
    }
}
