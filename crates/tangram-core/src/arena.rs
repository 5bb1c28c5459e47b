//! Byte arena backing all tensor storage.
//!
//! Tensors live in one contiguous byte buffer. Each allocation is described
//! by a slot in a generational slot map: a [`TensorId`] is an index plus a
//! generation, so a handle to freed storage is detected rather than silently
//! reading whatever reused the bytes.
//!
//! Freed ranges go onto a first-fit free list; adjacent holes coalesce, and
//! a hole at the end of the buffer shrinks the high-water mark.

use tracing::trace;

use crate::types::DType;
use crate::{Result, TangramError};

/// Opaque handle to a tensor's storage.
///
/// The generation changes every time a slot is reused, so stale ids from a
/// previous allocation never alias a live one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TensorId {
    index: u32,
    generation: u32,
}

struct Entry {
    offset: usize,
    len: usize,
    dtype: DType,
    /// Scope tracking this tensor, if any. `None` means untracked.
    scope: Option<u64>,
}

struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

/// Arena of tensor buffers with a generational slot map.
pub struct Arena {
    buf: Vec<u8>,
    /// Free byte ranges as (offset, len), sorted by offset, non-adjacent.
    holes: Vec<(usize, usize)>,
    slots: Vec<Slot>,
    vacant: Vec<u32>,
    live: usize,
}

impl Arena {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            holes: Vec::new(),
            slots: Vec::new(),
            vacant: Vec::new(),
            live: 0,
        }
    }

    /// Allocate zero-filled storage for `numel` elements of `dtype`.
    pub fn alloc(&mut self, numel: usize, dtype: DType) -> TensorId {
        let len = numel * dtype.size_bytes();
        let offset = self.reserve(len);
        self.buf[offset..offset + len].fill(0);

        let index = match self.vacant.pop() {
            Some(i) => {
                self.slots[i as usize].entry = Some(Entry {
                    offset,
                    len,
                    dtype,
                    scope: None,
                });
                i
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(Entry {
                        offset,
                        len,
                        dtype,
                        scope: None,
                    }),
                });
                (self.slots.len() - 1) as u32
            }
        };
        self.live += 1;

        let id = TensorId {
            index,
            generation: self.slots[index as usize].generation,
        };
        trace!(?id, offset, len, %dtype, "arena alloc");
        id
    }

    /// First-fit search of the free list, falling back to growing the buffer.
    /// A hole larger than the request is split.
    fn reserve(&mut self, len: usize) -> usize {
        for i in 0..self.holes.len() {
            let (off, hole_len) = self.holes[i];
            if hole_len >= len {
                if hole_len == len {
                    self.holes.remove(i);
                } else {
                    self.holes[i] = (off + len, hole_len - len);
                }
                return off;
            }
        }
        let off = self.buf.len();
        self.buf.resize(off + len, 0);
        off
    }

    /// Free the storage behind `id`. Erroring on a stale id catches
    /// use-after-dispose and double-dispose.
    pub fn free(&mut self, id: TensorId) -> Result<()> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .ok_or(TangramError::DeadTensor)?;
        if slot.generation != id.generation {
            return Err(TangramError::DeadTensor);
        }
        let Some(entry) = slot.entry.take() else {
            return Err(TangramError::DeadTensor);
        };
        slot.generation = slot.generation.wrapping_add(1);
        self.vacant.push(id.index);
        self.live -= 1;
        trace!(?id, offset = entry.offset, len = entry.len, "arena free");
        self.release(entry.offset, entry.len);
        Ok(())
    }

    /// Free `id` if it is still live. Used by scope sweeps, where a tensor
    /// may already have been disposed by hand inside the scope.
    pub fn free_if_live(&mut self, id: TensorId) -> bool {
        if self.contains(id) {
            // Live by the check above, so free cannot fail.
            let _ = self.free(id);
            true
        } else {
            false
        }
    }

    fn release(&mut self, offset: usize, len: usize) {
        if len == 0 {
            return;
        }
        let pos = self
            .holes
            .binary_search_by_key(&offset, |&(off, _)| off)
            .unwrap_or_else(|p| p);
        self.holes.insert(pos, (offset, len));

        // Coalesce with the hole after, then the hole before.
        if pos + 1 < self.holes.len() {
            let (off, l) = self.holes[pos];
            let (next_off, next_len) = self.holes[pos + 1];
            if off + l == next_off {
                self.holes[pos] = (off, l + next_len);
                self.holes.remove(pos + 1);
            }
        }
        if pos > 0 {
            let (prev_off, prev_len) = self.holes[pos - 1];
            let (off, l) = self.holes[pos];
            if prev_off + prev_len == off {
                self.holes[pos - 1] = (prev_off, prev_len + l);
                self.holes.remove(pos);
            }
        }

        // Trailing hole: give the bytes back to the buffer.
        if let Some(&(last_off, last_len)) = self.holes.last() {
            if last_off + last_len == self.buf.len() {
                self.buf.truncate(last_off);
                self.holes.pop();
            }
        }
    }

    pub fn contains(&self, id: TensorId) -> bool {
        self.slots
            .get(id.index as usize)
            .map(|s| s.generation == id.generation && s.entry.is_some())
            .unwrap_or(false)
    }

    fn entry(&self, id: TensorId) -> Result<&Entry> {
        let slot = self
            .slots
            .get(id.index as usize)
            .ok_or(TangramError::DeadTensor)?;
        if slot.generation != id.generation {
            return Err(TangramError::DeadTensor);
        }
        slot.entry.as_ref().ok_or(TangramError::DeadTensor)
    }

    fn entry_mut(&mut self, id: TensorId) -> Result<&mut Entry> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .ok_or(TangramError::DeadTensor)?;
        if slot.generation != id.generation {
            return Err(TangramError::DeadTensor);
        }
        slot.entry.as_mut().ok_or(TangramError::DeadTensor)
    }

    /// Byte offset of this tensor's storage within the arena buffer.
    pub fn offset_of(&self, id: TensorId) -> Result<usize> {
        Ok(self.entry(id)?.offset)
    }

    pub fn dtype_of(&self, id: TensorId) -> Result<DType> {
        Ok(self.entry(id)?.dtype)
    }

    pub fn scope_of(&self, id: TensorId) -> Result<Option<u64>> {
        Ok(self.entry(id)?.scope)
    }

    pub fn set_scope(&mut self, id: TensorId, scope: Option<u64>) -> Result<()> {
        self.entry_mut(id)?.scope = scope;
        Ok(())
    }

    pub fn bytes(&self, id: TensorId) -> Result<&[u8]> {
        let entry = self.entry(id)?;
        Ok(&self.buf[entry.offset..entry.offset + entry.len])
    }

    pub fn bytes_mut(&mut self, id: TensorId) -> Result<&mut [u8]> {
        let entry = self.entry(id)?;
        let (offset, len) = (entry.offset, entry.len);
        Ok(&mut self.buf[offset..offset + len])
    }

    /// Decode this tensor's storage as f32.
    pub fn read_f32(&self, id: TensorId) -> Result<Vec<f32>> {
        let dtype = self.dtype_of(id)?;
        if dtype != DType::F32 {
            return Err(TangramError::DTypeMismatch {
                expected: DType::F32,
                got: dtype,
            });
        }
        Ok(self
            .bytes(id)?
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    /// Decode this tensor's storage as i32.
    pub fn read_i32(&self, id: TensorId) -> Result<Vec<i32>> {
        let dtype = self.dtype_of(id)?;
        if dtype != DType::I32 {
            return Err(TangramError::DTypeMismatch {
                expected: DType::I32,
                got: dtype,
            });
        }
        Ok(self
            .bytes(id)?
            .chunks_exact(4)
            .map(|c| i32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    pub fn write_f32(&mut self, id: TensorId, data: &[f32]) -> Result<()> {
        let bytes = self.bytes_mut(id)?;
        debug_assert_eq!(bytes.len(), data.len() * 4);
        for (chunk, v) in bytes.chunks_exact_mut(4).zip(data) {
            chunk.copy_from_slice(&v.to_ne_bytes());
        }
        Ok(())
    }

    pub fn write_i32(&mut self, id: TensorId, data: &[i32]) -> Result<()> {
        let bytes = self.bytes_mut(id)?;
        debug_assert_eq!(bytes.len(), data.len() * 4);
        for (chunk, v) in bytes.chunks_exact_mut(4).zip(data) {
            chunk.copy_from_slice(&v.to_ne_bytes());
        }
        Ok(())
    }

    /// Number of live tensors.
    pub fn live_count(&self) -> usize {
        self.live
    }

    /// Bytes currently reserved by live tensors.
    pub fn bytes_in_use(&self) -> usize {
        self.buf.len() - self.holes.iter().map(|&(_, len)| len).sum::<usize>()
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_read() {
        let mut arena = Arena::new();
        let id = arena.alloc(3, DType::F32);
        assert_eq!(arena.read_f32(id).unwrap(), vec![0.0; 3]);
        arena.write_f32(id, &[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(arena.read_f32(id).unwrap(), vec![1.0, 2.0, 3.0]);
        assert_eq!(arena.live_count(), 1);
        assert_eq!(arena.bytes_in_use(), 12);
    }

    #[test]
    fn test_use_after_free_is_error() {
        let mut arena = Arena::new();
        let id = arena.alloc(2, DType::F32);
        arena.free(id).unwrap();
        assert!(matches!(
            arena.read_f32(id),
            Err(TangramError::DeadTensor)
        ));
        assert!(matches!(arena.free(id), Err(TangramError::DeadTensor)));
    }

    #[test]
    fn test_generation_prevents_stale_alias() {
        let mut arena = Arena::new();
        let a = arena.alloc(2, DType::F32);
        arena.free(a).unwrap();
        // Reuses the slot; the old handle must stay dead.
        let b = arena.alloc(2, DType::F32);
        assert_ne!(a, b);
        assert!(arena.read_f32(a).is_err());
        assert!(arena.read_f32(b).is_ok());
    }

    #[test]
    fn test_interior_free_is_reused() {
        let mut arena = Arena::new();
        let a = arena.alloc(4, DType::F32);
        let b = arena.alloc(4, DType::F32);
        let _c = arena.alloc(4, DType::F32);
        let high_water = arena.buf.len();

        arena.free(b).unwrap();
        let d = arena.alloc(4, DType::F32);
        // d reuses b's hole; no growth.
        assert_eq!(arena.buf.len(), high_water);
        assert_eq!(arena.offset_of(d).unwrap(), 16);
        assert_eq!(arena.offset_of(a).unwrap(), 0);
    }

    #[test]
    fn test_trailing_free_shrinks_buffer() {
        let mut arena = Arena::new();
        let a = arena.alloc(4, DType::F32);
        let b = arena.alloc(4, DType::F32);
        arena.free(b).unwrap();
        assert_eq!(arena.buf.len(), 16);
        arena.free(a).unwrap();
        assert_eq!(arena.buf.len(), 0);
        assert_eq!(arena.bytes_in_use(), 0);
    }

    #[test]
    fn test_holes_coalesce() {
        let mut arena = Arena::new();
        let a = arena.alloc(4, DType::F32);
        let b = arena.alloc(4, DType::F32);
        let _anchor = arena.alloc(1, DType::U8);
        arena.free(a).unwrap();
        arena.free(b).unwrap();
        // One merged hole big enough for an 8-element tensor.
        assert_eq!(arena.holes.len(), 1);
        let big = arena.alloc(8, DType::F32);
        assert_eq!(arena.offset_of(big).unwrap(), 0);
    }

    #[test]
    fn test_free_if_live() {
        let mut arena = Arena::new();
        let a = arena.alloc(2, DType::I32);
        assert!(arena.free_if_live(a));
        assert!(!arena.free_if_live(a));
    }
}
