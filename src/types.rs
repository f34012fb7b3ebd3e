use std::fmt;

use derive_more::{Add, Deref, DerefMut, Sub};
use glam::{IVec3, Vec3};

// primes of the spatial hash, one per axis
const HASH_P1: u32 = 73_856_093;
const HASH_P2: u32 = 19_349_669;
const HASH_P3: u32 = 83_492_791;

/// Position of a voxel block in block space.
///
/// Block space is world space divided by the block extent `R * v`; the
/// block at (i, j, k) covers world `[i*R*v, (i+1)*R*v)` on x and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deref, DerefMut, Add, Sub)]
pub struct BlockCoord(pub IVec3);

impl BlockCoord {
	pub fn new(i: i32, j: i32, k: i32) -> Self {
		BlockCoord(IVec3::new(i, j, k))
	}

	pub fn splat(v: i32) -> Self {
		BlockCoord(IVec3::splat(v))
	}

	// floor division so negative world coordinates land in the right block
	pub fn from_world(point: Vec3, block_extent: f32) -> Self {
		BlockCoord((point / block_extent).floor().as_ivec3())
	}

	/// World position of the minimum corner of this block.
	pub fn world_origin(&self, resolution: usize, voxel_size: f32) -> Vec3 {
		self.0.as_vec3() * (resolution as f32 * voxel_size)
	}

	/// World position of the center of the voxel at `local` inside this block.
	#[inline]
	pub fn voxel_center(&self, local: IVec3, resolution: usize, voxel_size: f32) -> Vec3 {
		((self.0 * resolution as i32 + local).as_vec3() + Vec3::splat(0.5)) * voxel_size
	}

	pub fn offset(&self, di: i32, dj: i32, dk: i32) -> Self {
		BlockCoord(self.0 + IVec3::new(di, dj, dk))
	}

	/// Bucket of this coordinate in a table of `bucket_count` buckets.
	#[inline]
	pub fn bucket(&self, bucket_count: usize) -> usize {
		let h = (self.x as u32).wrapping_mul(HASH_P1)
			^ (self.y as u32).wrapping_mul(HASH_P2)
			^ (self.z as u32).wrapping_mul(HASH_P3);
		h as usize % bucket_count
	}
}

impl fmt::Display for BlockCoord {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "({}, {}, {})", self.x, self.y, self.z)
	}
}

/// Stable slot of an allocated block inside the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockIndex(pub u32);

impl BlockIndex {
	#[inline]
	pub fn index(self) -> usize {
		self.0 as usize
	}
}

impl fmt::Display for BlockIndex {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn from_world_floors_negative_coordinates() {
		let extent = 0.08; // 8 voxels of 1cm
		assert_eq!(BlockCoord::from_world(Vec3::new(0.01, 0.01, 0.01), extent), BlockCoord::new(0, 0, 0));
		assert_eq!(BlockCoord::from_world(Vec3::new(-0.01, 0.0, 0.09), extent), BlockCoord::new(-1, 0, 1));
		assert_eq!(BlockCoord::from_world(Vec3::new(-0.08, -0.09, 0.0), extent), BlockCoord::new(-1, -2, 0));
	}

	#[test]
	fn voxel_center_round_trip() {
		let coord = BlockCoord::new(1, -1, 0);
		let center = coord.voxel_center(IVec3::new(0, 7, 3), 8, 0.01);
		assert!((center.x - 0.085).abs() < 1e-6);
		assert!((center.y - -0.005).abs() < 1e-6);
		assert!((center.z - 0.035).abs() < 1e-6);
		// the center maps back into the block it came from
		assert_eq!(BlockCoord::from_world(center, 8.0 * 0.01), coord);
	}

	#[test]
	fn bucket_is_stable_and_in_range() {
		let coord = BlockCoord::new(-5, 17, 3);
		let b = coord.bucket(1024);
		assert!(b < 1024);
		assert_eq!(b, coord.bucket(1024));
		// a different coordinate in the same bucket range
		assert!(BlockCoord::new(0, 0, 0).bucket(17) < 17);
	}
}
