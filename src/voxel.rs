use bytemuck::{Pod, Zeroable};
use glam::{IVec3, Vec3};

/// A single tsdf sample.
///
/// `tsdf` is the signed distance to the nearest observed surface,
/// truncated and normalized to [-1, 1]; `weight` counts the observations
/// fused into it (saturated during integration). An unobserved voxel has
/// weight 0 and sits at the far-outside default of tsdf 1.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Voxel {
	pub tsdf: f32,
	pub weight: f32,
	pub color: [f32; 3],
}

impl Voxel {
	pub const DEFAULT: Voxel = Voxel {
		tsdf: 1.0,
		weight: 0.0,
		color: [0.0; 3],
	};

	#[inline]
	pub fn is_observed(&self) -> bool {
		self.weight > 0.0
	}

	#[inline]
	pub fn color_vec(&self) -> Vec3 {
		Vec3::from_array(self.color)
	}
}

impl Default for Voxel {
	fn default() -> Self {
		Self::DEFAULT
	}
}

/// An R x R x R cube of voxels stored contiguously.
///
/// Storage is (a, b, c) row major with c varying fastest. Blocks never
/// move once allocated; the pool hands out stable slot indices to them.
pub struct VoxelBlock {
	voxels: Box<[Voxel]>,
	resolution: usize,
}

impl VoxelBlock {
	pub fn new(resolution: usize) -> Self {
		VoxelBlock {
			voxels: vec![Voxel::DEFAULT; resolution * resolution * resolution].into_boxed_slice(),
			resolution,
		}
	}

	#[inline]
	pub fn resolution(&self) -> usize {
		self.resolution
	}

	/// Restores every voxel to the unobserved default state.
	pub fn reset(&mut self) {
		self.voxels.fill(Voxel::DEFAULT);
	}

	#[inline]
	pub fn contains_local(&self, local: IVec3) -> bool {
		let r = self.resolution as i32;
		local.x >= 0 && local.x < r
			&& local.y >= 0 && local.y < r
			&& local.z >= 0 && local.z < r
	}

	#[inline]
	pub fn linear_index(&self, local: IVec3) -> usize {
		debug_assert!(self.contains_local(local));
		let r = self.resolution;
		(local.x as usize * r + local.y as usize) * r + local.z as usize
	}

	#[inline]
	pub fn voxel(&self, local: IVec3) -> Voxel {
		self.voxels[self.linear_index(local)]
	}

	#[inline]
	pub fn voxel_mut(&mut self, local: IVec3) -> &mut Voxel {
		let index = self.linear_index(local);
		&mut self.voxels[index]
	}

	pub fn as_slice(&self) -> &[Voxel] {
		&self.voxels
	}

	pub fn as_mut_slice(&mut self) -> &mut [Voxel] {
		&mut self.voxels
	}
}
