use std::cell::UnsafeCell;

use parking_lot::Mutex;

use crate::prelude::*;
use crate::voxel::VoxelBlock;

struct PoolState {
	// LIFO so recently freed slots are handed out again while still hot
	free: Vec<u32>,
	in_use: Box<[bool]>,
}

/// Fixed-capacity arena of voxel blocks addressed by stable slot index.
///
/// Slot bookkeeping lives behind one mutex; the block storage itself is
/// unlocked. Phase C of integration and pass 1 of extraction mutate
/// blocks without locks because each slot has exactly one writer there,
/// established by partitioning the active set across workers.
pub struct BlockPool {
	blocks: Box<[UnsafeCell<VoxelBlock>]>,
	state: Mutex<PoolState>,
	resolution: usize,
}

// safety: block storage is only written through allocate (which owns the
// freshly popped slot) or block_mut (whose contract is single-writer slot
// ownership), so shared access never races
unsafe impl Send for BlockPool {}
unsafe impl Sync for BlockPool {}

impl BlockPool {
	pub fn new(capacity: usize, resolution: usize) -> Self {
		let blocks = (0..capacity)
			.map(|_| UnsafeCell::new(VoxelBlock::new(resolution)))
			.collect::<Vec<_>>()
			.into_boxed_slice();

		BlockPool {
			blocks,
			state: Mutex::new(PoolState {
				free: (0..capacity as u32).rev().collect(),
				in_use: vec![false; capacity].into_boxed_slice(),
			}),
			resolution,
		}
	}

	pub fn capacity(&self) -> usize {
		self.blocks.len()
	}

	pub fn resolution(&self) -> usize {
		self.resolution
	}

	pub fn allocated_len(&self) -> usize {
		let state = self.state.lock();
		self.blocks.len() - state.free.len()
	}

	/// Takes a free slot and resets its voxels to the unobserved default.
	pub fn allocate(&self) -> Result<BlockIndex> {
		let slot = {
			let mut state = self.state.lock();
			let slot = state.free.pop().ok_or(Error::OutOfCapacity {
				capacity: self.blocks.len(),
			})?;
			state.in_use[slot as usize] = true;
			slot
		};

		// the slot now belongs to this caller alone, reset outside the lock
		unsafe { (*self.blocks[slot as usize].get()).reset() };
		Ok(BlockIndex(slot))
	}

	/// Returns a slot to the free list.
	///
	/// Freeing a slot that is not allocated is a broken invariant and
	/// panics.
	pub fn free(&self, slot: BlockIndex) {
		let mut state = self.state.lock();
		assert!(
			state.in_use[slot.index()],
			"double free of block pool slot {slot}"
		);
		state.in_use[slot.index()] = false;
		state.free.push(slot.0);
	}

	pub fn is_free(&self, slot: BlockIndex) -> bool {
		!self.state.lock().in_use[slot.index()]
	}

	/// Shared view of an allocated block. O(1).
	///
	/// Callers must not hold this across a phase that writes the same
	/// slot; readers and the single writer of a slot are separated by the
	/// phase structure, not by a lock.
	#[inline]
	pub fn get(&self, slot: BlockIndex) -> &VoxelBlock {
		unsafe { &*self.blocks[slot.index()].get() }
	}

	/// Exclusive view of an allocated block without locking. O(1).
	///
	/// # Safety
	///
	/// The caller must be the only writer of `slot` for the lifetime of
	/// the returned reference and no concurrent reader may observe it.
	/// Integration Phase C guarantees this by giving each worker a
	/// disjoint partition of the active slots.
	#[inline]
	#[allow(clippy::mut_from_ref)]
	pub unsafe fn block_mut(&self, slot: BlockIndex) -> &mut VoxelBlock {
		&mut *self.blocks[slot.index()].get()
	}
}
