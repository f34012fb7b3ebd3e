use std::sync::Arc;

use glam::{IVec3, Mat3, Mat4, Vec3};
use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::hashmap::SpatialHashmap;
use crate::image::{ColorImage, DepthImage};
use crate::integrate::{self, IntegrateOptions};
use crate::marching_cubes;
use crate::mesh::{Aabb, Geometry, PointCloud, TriangleMesh};
use crate::pool::BlockPool;
use crate::prelude::*;

/// Placement hint for heterogeneous builds.
///
/// This build executes on the cpu and accepts the hint without acting on
/// it; a device backend would re-implement the three hot paths behind the
/// same public contracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Device {
	#[default]
	Cpu,
}

/// How the active block set evolves across integrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActiveMode {
	/// the active set holds the blocks touched by the latest integration
	#[default]
	PerFrame,
	/// the active set accumulates every block ever touched
	Monotonic,
}

pub(crate) struct ActiveSet {
	pub entries: Vec<(BlockCoord, BlockIndex)>,
	members: FxHashSet<BlockIndex>,
}

impl ActiveSet {
	fn new() -> Self {
		ActiveSet {
			entries: Vec::new(),
			members: FxHashSet::default(),
		}
	}

	pub fn clear(&mut self) {
		self.entries.clear();
		self.members.clear();
	}

	// keeps the set duplicate free
	pub fn push(&mut self, coord: BlockCoord, slot: BlockIndex) {
		if self.members.insert(slot) {
			self.entries.push((coord, slot));
		}
	}
}

/// Sparse, block-allocated truncated signed distance volume.
///
/// Depth frames are fused with [`TsdfVolume::integrate`]; surfaces come
/// back out of [`TsdfVolume::extract_surface_points`] and
/// [`TsdfVolume::marching_cubes`]. Blocks are allocated on demand along
/// the observed rays and live in a fixed-capacity pool.
pub struct TsdfVolume {
	pub(crate) voxel_size: f32,
	pub(crate) sdf_trunc: f32,
	pub(crate) resolution: usize,
	pub(crate) pool: Arc<BlockPool>,
	pub(crate) hashmap: SpatialHashmap,
	pub(crate) active: Mutex<ActiveSet>,
	active_mode: ActiveMode,
	device: Device,
}

impl TsdfVolume {
	pub fn new(
		voxel_size: f32,
		sdf_trunc: f32,
		resolution: i64,
		capacity: i64,
		device: Device,
	) -> Result<Self> {
		if !(voxel_size.is_finite() && voxel_size > 0.0) {
			return Err(Error::invalid(format!("voxel size must be positive, got {voxel_size}")));
		}
		if !(sdf_trunc.is_finite() && sdf_trunc >= voxel_size) {
			return Err(Error::invalid(format!(
				"sdf truncation {sdf_trunc} must be at least the voxel size {voxel_size}"
			)));
		}
		if resolution < 2 {
			return Err(Error::invalid(format!("block resolution must be at least 2, got {resolution}")));
		}
		if capacity < 1 {
			return Err(Error::invalid(format!("capacity must be at least 1, got {capacity}")));
		}

		let resolution = resolution as usize;
		let capacity = capacity as usize;
		let pool = Arc::new(BlockPool::new(capacity, resolution));
		// two expected entries per bucket keeps chains inside the inline heads
		let bucket_count = (capacity / 2).max(16);
		let hashmap = SpatialHashmap::new(bucket_count, pool.clone());

		info!(
			"tsdf volume: voxel size {voxel_size} m, truncation {sdf_trunc} m, {resolution}^3 blocks, capacity {capacity}"
		);

		Ok(TsdfVolume {
			voxel_size,
			sdf_trunc,
			resolution,
			pool,
			hashmap,
			active: Mutex::new(ActiveSet::new()),
			active_mode: ActiveMode::default(),
			device,
		})
	}

	pub fn voxel_size(&self) -> f32 {
		self.voxel_size
	}

	pub fn sdf_trunc(&self) -> f32 {
		self.sdf_trunc
	}

	pub fn resolution(&self) -> usize {
		self.resolution
	}

	pub fn capacity(&self) -> usize {
		self.pool.capacity()
	}

	pub fn device(&self) -> Device {
		self.device
	}

	/// World-space edge length of one block.
	#[inline]
	pub fn block_extent(&self) -> f32 {
		self.resolution as f32 * self.voxel_size
	}

	pub fn active_mode(&self) -> ActiveMode {
		self.active_mode
	}

	pub fn set_active_mode(&mut self, mode: ActiveMode) {
		self.active_mode = mode;
	}

	pub fn allocated_blocks(&self) -> usize {
		self.pool.allocated_len()
	}

	/// Pool slots touched by the most recent integration (or all touched
	/// slots ever, in monotonic mode). Duplicate free.
	pub fn active_blocks(&self) -> Vec<BlockIndex> {
		self.active.lock().entries.iter().map(|(_, slot)| *slot).collect()
	}

	pub(crate) fn begin_frame_active(&self) {
		if self.active_mode == ActiveMode::PerFrame {
			self.active.lock().clear();
		}
	}

	/// Fuses one depth frame.
	///
	/// `intrinsic` is the row-major 3x3 pinhole matrix, `extrinsic` the
	/// world-to-camera rigid transform. Frames are serialized by the
	/// exclusive borrow; pool exhaustion integrates the blocks that did
	/// fit and logs a warning.
	pub fn integrate(&mut self, depth: &DepthImage, intrinsic: &Mat3, extrinsic: &Mat4) -> Result<()> {
		integrate::integrate_frame(self, depth, None, intrinsic, extrinsic, &IntegrateOptions::default())
	}

	/// Fuses one depth frame together with a registered color frame.
	pub fn integrate_with_color(
		&mut self,
		depth: &DepthImage,
		color: &ColorImage,
		intrinsic: &Mat3,
		extrinsic: &Mat4,
	) -> Result<()> {
		integrate::integrate_frame(self, depth, Some(color), intrinsic, extrinsic, &IntegrateOptions::default())
	}

	/// [`TsdfVolume::integrate`] with explicit options (weight ceiling,
	/// cooperative cancellation).
	pub fn integrate_with_options(
		&mut self,
		depth: &DepthImage,
		color: Option<&ColorImage>,
		intrinsic: &Mat3,
		extrinsic: &Mat4,
		options: &IntegrateOptions,
	) -> Result<()> {
		integrate::integrate_frame(self, depth, color, intrinsic, extrinsic, options)
	}

	/// Reads the voxel at `local` relative to block `coord`.
	///
	/// `local` may leave the [0, R) cube on any axis; the lookup then
	/// resolves the neighboring block through the hashmap. `None` marks
	/// an absent neighbor and callers must treat the touching edge or
	/// cube as unavailable.
	pub fn voxel_at(&self, coord: BlockCoord, local: IVec3) -> Option<Voxel> {
		let r = self.resolution as i32;
		let shift = IVec3::new(
			local.x.div_euclid(r),
			local.y.div_euclid(r),
			local.z.div_euclid(r),
		);
		let wrapped = IVec3::new(
			local.x.rem_euclid(r),
			local.y.rem_euclid(r),
			local.z.rem_euclid(r),
		);

		let slot = self.hashmap.find(BlockCoord(coord.0 + shift))?;
		Some(self.pool.get(slot).voxel(wrapped))
	}

	/// Central-difference tsdf gradient at `local` relative to `coord`,
	/// falling back to one-sided differences where a neighbor is absent.
	pub(crate) fn tsdf_gradient(&self, coord: BlockCoord, local: IVec3) -> Vec3 {
		let mut gradient = Vec3::ZERO;
		let here = self.voxel_at(coord, local);

		for axis in 0..3 {
			let mut step = IVec3::ZERO;
			step[axis] = 1;
			let forward = self.voxel_at(coord, local + step).filter(|v| v.is_observed());
			let backward = self.voxel_at(coord, local - step).filter(|v| v.is_observed());

			gradient[axis] = match (forward, backward) {
				(Some(f), Some(b)) => (f.tsdf - b.tsdf) * 0.5,
				(Some(f), None) => here.map(|h| f.tsdf - h.tsdf).unwrap_or(0.0),
				(None, Some(b)) => here.map(|h| h.tsdf - b.tsdf).unwrap_or(0.0),
				(None, None) => 0.0,
			};
		}

		gradient
	}

	/// Entries of every allocated block, sorted by coordinate so walks
	/// over them are deterministic.
	pub(crate) fn sorted_entries(&self) -> Vec<(BlockCoord, BlockIndex)> {
		let mut entries = self.hashmap.iter_entries();
		entries.sort_unstable_by_key(|(coord, _)| (coord.x, coord.y, coord.z));
		entries
	}

	/// Surface samples at tsdf zero crossings along the three forward
	/// axis edges of every observed voxel.
	pub fn extract_surface_points(&self) -> PointCloud {
		let mut cloud = PointCloud::default();
		let resolution = self.resolution as i32;

		for (coord, slot) in self.sorted_entries() {
			let block = self.pool.get(slot);
			for a in 0..resolution {
				for b in 0..resolution {
					for c in 0..resolution {
						let local = IVec3::new(a, b, c);
						let voxel = block.voxel(local);
						if !voxel.is_observed() {
							continue;
						}

						for axis in 0..3 {
							let mut step = IVec3::ZERO;
							step[axis] = 1;
							let Some(neighbor) = self.voxel_at(coord, local + step) else {
								continue;
							};
							if !neighbor.is_observed() || voxel.tsdf * neighbor.tsdf >= 0.0 {
								continue;
							}

							let t = voxel.tsdf / (voxel.tsdf - neighbor.tsdf);
							let here = coord.voxel_center(local, self.resolution, self.voxel_size);
							let there = coord.voxel_center(local + step, self.resolution, self.voxel_size);
							cloud.positions.push(here.lerp(there, t));

							let gradient_here = self.tsdf_gradient(coord, local);
							let gradient_there = self.tsdf_gradient(coord, local + step);
							cloud
								.normals
								.push(gradient_here.lerp(gradient_there, t).normalize_or_zero());
							cloud
								.colors
								.push(voxel.color_vec().lerp(neighbor.color_vec(), t));
						}
					}
				}
			}
		}

		cloud
	}

	/// Extracts the isosurface as an indexed triangle mesh.
	pub fn marching_cubes(&self) -> TriangleMesh {
		marching_cubes::extract(self)
	}

	/// Frees every block and forgets the active set.
	pub fn clear(&mut self) {
		self.hashmap.clear();
		self.active.lock().clear();
	}
}

impl Geometry for TsdfVolume {
	fn is_empty(&self) -> bool {
		self.hashmap.is_empty()
	}

	fn bounding_box(&self) -> Option<Aabb> {
		let extent = self.block_extent();
		let entries = self.hashmap.iter_entries();
		let mut corners = Vec::with_capacity(entries.len() * 2);
		for (coord, _) in entries {
			let origin = coord.world_origin(self.resolution, self.voxel_size);
			corners.push(origin);
			corners.push(origin + Vec3::splat(extent));
		}
		Aabb::from_points(&corners)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn small_volume() -> TsdfVolume {
		TsdfVolume::new(0.01, 0.04, 8, 64, Device::Cpu).unwrap()
	}

	#[test]
	fn construction_validates_parameters() {
		assert!(TsdfVolume::new(0.0, 0.04, 8, 64, Device::Cpu).is_err());
		assert!(TsdfVolume::new(-0.01, 0.04, 8, 64, Device::Cpu).is_err());
		assert!(TsdfVolume::new(0.01, 0.005, 8, 64, Device::Cpu).is_err());
		assert!(TsdfVolume::new(0.01, 0.04, 1, 64, Device::Cpu).is_err());
		assert!(TsdfVolume::new(0.01, 0.04, 8, 0, Device::Cpu).is_err());
		assert!(TsdfVolume::new(0.01, 0.04, 8, 64, Device::Cpu).is_ok());
	}

	#[test]
	fn voxel_at_resolves_neighbor_blocks() {
		let volume = small_volume();
		let origin = BlockCoord::new(0, 0, 0);
		let (slot, _) = volume.hashmap.insert_if_absent(origin).unwrap();
		let (east, _) = volume.hashmap.insert_if_absent(BlockCoord::new(1, 0, 0)).unwrap();

		unsafe {
			volume.pool.block_mut(slot).voxel_mut(IVec3::new(7, 0, 0)).tsdf = -0.5;
			volume.pool.block_mut(east).voxel_mut(IVec3::new(0, 0, 0)).tsdf = 0.25;
		}

		// in-block read
		assert_eq!(volume.voxel_at(origin, IVec3::new(7, 0, 0)).unwrap().tsdf, -0.5);
		// crossing the +x face lands in the east block
		assert_eq!(volume.voxel_at(origin, IVec3::new(8, 0, 0)).unwrap().tsdf, 0.25);
		// negative offsets need an absent block
		assert!(volume.voxel_at(origin, IVec3::new(-1, 0, 0)).is_none());
	}

	#[test]
	fn clear_empties_everything() {
		let mut volume = small_volume();
		for k in 0..8 {
			volume.hashmap.insert_if_absent(BlockCoord::new(k, 0, 0)).unwrap();
		}
		assert!(!volume.is_empty());

		volume.clear();
		assert!(volume.is_empty());
		assert_eq!(volume.allocated_blocks(), 0);
		assert!(volume.active_blocks().is_empty());
		assert!(volume.hashmap.iter_entries().is_empty());
	}

	#[test]
	fn bounding_box_covers_allocated_blocks() {
		let volume = small_volume();
		volume.hashmap.insert_if_absent(BlockCoord::new(0, 0, 0)).unwrap();
		volume.hashmap.insert_if_absent(BlockCoord::new(2, 0, -1)).unwrap();

		let aabb = volume.bounding_box().unwrap();
		let extent = volume.block_extent();
		assert!((aabb.position - Vec3::new(0.0, 0.0, -extent)).length() < 1e-6);
		assert!((aabb.end() - Vec3::new(3.0 * extent, extent, extent)).length() < 1e-6);
	}
}
