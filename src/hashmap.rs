use std::sync::Arc;

use parking_lot::RwLock;

use crate::pool::BlockPool;
use crate::prelude::*;

/// Entries stored directly in a bucket head before chaining starts.
pub const BUCKET_INLINE_ENTRIES: usize = 4;

#[derive(Debug, Clone, Copy)]
struct Entry {
	coord: BlockCoord,
	slot: BlockIndex,
}

#[derive(Default)]
struct Bucket {
	inline: [Option<Entry>; BUCKET_INLINE_ENTRIES],
	overflow: Vec<Entry>,
}

impl Bucket {
	fn find(&self, coord: BlockCoord) -> Option<BlockIndex> {
		self.entries()
			.find(|entry| entry.coord == coord)
			.map(|entry| entry.slot)
	}

	// prefers an empty inline slot, chains otherwise
	fn insert(&mut self, entry: Entry) {
		for inline in self.inline.iter_mut() {
			if inline.is_none() {
				*inline = Some(entry);
				return;
			}
		}
		self.overflow.push(entry);
	}

	fn remove(&mut self, coord: BlockCoord) -> Option<BlockIndex> {
		for inline in self.inline.iter_mut() {
			if inline.map(|entry| entry.coord) == Some(coord) {
				return inline.take().map(|entry| entry.slot);
			}
		}
		let position = self.overflow.iter().position(|entry| entry.coord == coord)?;
		Some(self.overflow.swap_remove(position).slot)
	}

	fn entries(&self) -> impl Iterator<Item = &Entry> {
		self.inline.iter().flatten().chain(self.overflow.iter())
	}

	fn clear(&mut self) {
		self.inline = [None; BUCKET_INLINE_ENTRIES];
		self.overflow.clear();
	}
}

/// Result of a batched activation: one slot and one inserted flag per
/// input coordinate, `None` where the pool ran out of capacity.
pub struct BulkInsert {
	pub slots: Vec<Option<BlockIndex>>,
	pub inserted: Vec<bool>,
}

/// Bucket occupancy counters, used to watch hash dispersal.
#[derive(Debug, Clone, Copy)]
pub struct HashProfile {
	pub inline_entries: usize,
	pub overflow_entries: usize,
}

/// Concurrent map from block coordinates to pool slots.
///
/// Buckets are striped behind their own rwlocks; lookups share the lock,
/// mutation is exclusive per bucket. A new block's pool slot is allocated
/// while the bucket lock is held, so concurrent insertions of one
/// coordinate can never allocate twice.
pub struct SpatialHashmap {
	buckets: Box<[RwLock<Bucket>]>,
	pool: Arc<BlockPool>,
}

impl SpatialHashmap {
	pub fn new(bucket_count: usize, pool: Arc<BlockPool>) -> Self {
		assert!(bucket_count > 0, "hashmap needs at least one bucket");
		let buckets = (0..bucket_count)
			.map(|_| RwLock::new(Bucket::default()))
			.collect::<Vec<_>>()
			.into_boxed_slice();

		SpatialHashmap { buckets, pool }
	}

	pub fn bucket_count(&self) -> usize {
		self.buckets.len()
	}

	pub fn pool(&self) -> &BlockPool {
		&self.pool
	}

	#[inline]
	fn bucket_for(&self, coord: BlockCoord) -> &RwLock<Bucket> {
		&self.buckets[coord.bucket(self.buckets.len())]
	}

	pub fn find(&self, coord: BlockCoord) -> Option<BlockIndex> {
		self.bucket_for(coord).read().find(coord)
	}

	/// Returns the slot for `coord`, allocating a fresh block when the
	/// coordinate is new. The flag reports whether this call inserted.
	///
	/// For any interleaving of concurrent callers on one coordinate,
	/// exactly one observes `true`; the rest get the same slot back.
	pub fn insert_if_absent(&self, coord: BlockCoord) -> Result<(BlockIndex, bool)> {
		let mut bucket = self.bucket_for(coord).write();
		if let Some(slot) = bucket.find(coord) {
			return Ok((slot, false));
		}

		let slot = self.pool.allocate()?;
		bucket.insert(Entry { coord, slot });
		Ok((slot, true))
	}

	/// Activates a batch of coordinates, the canonical integrator path.
	///
	/// Capacity exhaustion is per input: failed coordinates report `None`
	/// and the rest of the batch proceeds. One warning summarizes the
	/// failures.
	pub fn bulk_insert(&self, coords: &[BlockCoord]) -> BulkInsert {
		let mut slots = Vec::with_capacity(coords.len());
		let mut inserted = Vec::with_capacity(coords.len());
		let mut exhausted = 0usize;

		for &coord in coords {
			match self.insert_if_absent(coord) {
				Ok((slot, new)) => {
					slots.push(Some(slot));
					inserted.push(new);
				}
				Err(_) => {
					exhausted += 1;
					slots.push(None);
					inserted.push(false);
				}
			}
		}

		if exhausted > 0 {
			warn!(
				"block pool exhausted: {} of {} touched blocks left unallocated",
				exhausted,
				coords.len()
			);
		}

		BulkInsert { slots, inserted }
	}

	/// Removes `coord` and frees its block. Returns whether it was present.
	pub fn erase(&self, coord: BlockCoord) -> bool {
		let removed = self.bucket_for(coord).write().remove(coord);
		match removed {
			Some(slot) => {
				self.pool.free(slot);
				true
			}
			None => false,
		}
	}

	/// Snapshot of all entries, bucket by bucket.
	///
	/// Concurrent mutation while the snapshot is being taken is
	/// unsupported.
	pub fn iter_entries(&self) -> Vec<(BlockCoord, BlockIndex)> {
		let mut out = Vec::new();
		for bucket in self.buckets.iter() {
			let bucket = bucket.read();
			out.extend(bucket.entries().map(|entry| (entry.coord, entry.slot)));
		}
		out
	}

	pub fn len(&self) -> usize {
		self.buckets
			.iter()
			.map(|bucket| bucket.read().entries().count())
			.sum()
	}

	pub fn is_empty(&self) -> bool {
		self.buckets
			.iter()
			.all(|bucket| bucket.read().entries().next().is_none())
	}

	/// Frees every block and empties every bucket.
	pub fn clear(&self) {
		for bucket in self.buckets.iter() {
			let mut bucket = bucket.write();
			for entry in bucket.entries() {
				self.pool.free(entry.slot);
			}
			bucket.clear();
		}
	}

	pub fn profile(&self) -> HashProfile {
		let mut profile = HashProfile {
			inline_entries: 0,
			overflow_entries: 0,
		};
		for bucket in self.buckets.iter() {
			let bucket = bucket.read();
			profile.inline_entries += bucket.inline.iter().flatten().count();
			profile.overflow_entries += bucket.overflow.len();
		}
		profile
	}
}
