use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use glam::{IVec3, Mat3, Mat4};

use crate::image::{depth_valid, CameraIntrinsic, ColorImage, DepthImage};
use crate::prelude::*;
use crate::volume::TsdfVolume;

/// Tuning knobs of a single integration call.
#[derive(Clone, Default)]
pub struct IntegrateOptions {
	/// Per-voxel observation weight ceiling; `None` uses the default of
	/// 255. Saturation keeps long-observed voxels responsive to change.
	pub max_weight: Option<f32>,
	/// Cooperative cancellation flag, checked at phase boundaries only;
	/// once the voxel update phase begins it runs to completion.
	pub cancel: Option<Arc<AtomicBool>>,
}

pub const DEFAULT_MAX_WEIGHT: f32 = 255.0;

impl IntegrateOptions {
	fn max_weight(&self) -> f32 {
		self.max_weight.unwrap_or(DEFAULT_MAX_WEIGHT)
	}

	fn cancelled(&self) -> bool {
		self.cancel
			.as_ref()
			.map(|flag| flag.load(Ordering::Acquire))
			.unwrap_or(false)
	}
}

/// Fuses one depth (and optionally color) frame into the volume.
///
/// Phase A projects every valid pixel's truncation interval into block
/// space and collects the touched coordinates; phase B activates them
/// through the hashmap; phase C updates the voxels of the active blocks
/// in parallel, lock free because every worker owns a disjoint slice of
/// the active set.
pub(crate) fn integrate_frame(
	volume: &mut TsdfVolume,
	depth: &DepthImage,
	color: Option<&ColorImage>,
	intrinsic: &Mat3,
	extrinsic: &Mat4,
	options: &IntegrateOptions,
) -> Result<()> {
	let intrinsic = CameraIntrinsic::from_matrix(intrinsic)?;
	let camera_to_world = world_to_camera_inverse(extrinsic)?;
	if let Some(color) = color {
		if color.width() != depth.width() || color.height() != depth.height() {
			return Err(Error::invalid("color frame shape differs from depth frame"));
		}
	}

	// phase a: touched block coordinates
	let touched = touch_blocks(volume, depth, &intrinsic, &camera_to_world);
	if options.cancelled() {
		debug!("integration cancelled after block touching");
		return Ok(());
	}

	// phase b: activation
	let mut coords: Vec<BlockCoord> = touched.into_iter().collect();
	// deterministic activation order makes slot assignment reproducible
	coords.sort_unstable_by_key(|coord| (coord.x, coord.y, coord.z));
	let bulk = volume.hashmap.bulk_insert(&coords);

	volume.begin_frame_active();
	{
		let mut active = volume.active.lock();
		for (coord, slot) in coords.iter().zip(bulk.slots.iter()) {
			if let Some(slot) = *slot {
				active.push(*coord, slot);
			}
		}
	}

	let frame_blocks: Vec<(BlockCoord, BlockIndex)> = coords
		.iter()
		.zip(bulk.slots.iter())
		.filter_map(|(coord, slot)| slot.map(|slot| (*coord, slot)))
		.collect();

	if options.cancelled() {
		debug!("integration cancelled after activation");
		return Ok(());
	}

	// phase c: voxel updates
	let saturated = update_voxels(volume, &frame_blocks, depth, color, &intrinsic, extrinsic, options);
	if saturated > 0 {
		debug!("weight ceiling reached on {saturated} voxel updates");
	}

	debug!(
		"integrated {}x{} frame into {} blocks ({} touched)",
		depth.width(),
		depth.height(),
		frame_blocks.len(),
		coords.len()
	);
	Ok(())
}

fn world_to_camera_inverse(extrinsic: &Mat4) -> Result<Mat4> {
	if !extrinsic.is_finite() {
		return Err(Error::invalid("non-finite extrinsic matrix"));
	}
	let det = extrinsic.determinant();
	if det.abs() < 1e-12 {
		return Err(Error::invalid("singular extrinsic matrix"));
	}
	Ok(extrinsic.inverse())
}

fn touch_blocks(
	volume: &TsdfVolume,
	depth: &DepthImage,
	intrinsic: &CameraIntrinsic,
	camera_to_world: &Mat4,
) -> FxDashSet<BlockCoord> {
	let touched = FxDashSet::default();
	let height = depth.height();
	let workers = num_cpus::get().min(height).max(1);
	let rows_per_worker = height.div_ceil(workers);

	crossbeam::thread::scope(|scope| {
		for band in 0..workers {
			let touched = &touched;
			let row_range = band * rows_per_worker..((band + 1) * rows_per_worker).min(height);
			scope.spawn(move |_| {
				for row in row_range {
					for u in 0..depth.width() {
						let d = depth.at(u, row);
						if !depth_valid(d) {
							continue;
						}
						touch_ray(volume, touched, intrinsic, camera_to_world, u, row, d);
					}
				}
			});
		}
	})
	.expect("block touching worker panicked");

	touched
}

// walks the truncation interval of one pixel ray and records every block
// it passes through
fn touch_ray(
	volume: &TsdfVolume,
	touched: &FxDashSet<BlockCoord>,
	intrinsic: &CameraIntrinsic,
	camera_to_world: &Mat4,
	u: usize,
	row: usize,
	d: f32,
) {
	let extent = volume.block_extent();
	let ray = intrinsic.unproject(u as f32, row as f32);

	// sample spacing along the ray must not exceed the block extent
	let span = 2.0 * volume.sdf_trunc;
	let steps = ((span * ray.length() / extent).ceil() as usize).max(1);

	for step in 0..=steps {
		let z = d - volume.sdf_trunc + span * step as f32 / steps as f32;
		if z <= 0.0 {
			continue;
		}
		let world = camera_to_world.transform_point3(ray * z);
		touched.insert(BlockCoord::from_world(world, extent));
	}
}

fn update_voxels(
	volume: &TsdfVolume,
	frame_blocks: &[(BlockCoord, BlockIndex)],
	depth: &DepthImage,
	color: Option<&ColorImage>,
	intrinsic: &CameraIntrinsic,
	extrinsic: &Mat4,
	options: &IntegrateOptions,
) -> usize {
	if frame_blocks.is_empty() {
		return 0;
	}

	let workers = num_cpus::get().min(frame_blocks.len()).max(1);
	let blocks_per_worker = frame_blocks.len().div_ceil(workers);
	let saturated = AtomicUsize::new(0);

	crossbeam::thread::scope(|scope| {
		for partition in frame_blocks.chunks(blocks_per_worker) {
			let saturated = &saturated;
			scope.spawn(move |_| {
				let mut saturated_local = 0usize;
				for &(coord, slot) in partition {
					// safety: every slot appears in frame_blocks once, and
					// partitions are disjoint, so this worker is the slot's
					// only writer
					let block = unsafe { volume.pool.block_mut(slot) };
					saturated_local +=
						update_block(volume, coord, block, depth, color, intrinsic, extrinsic, options);
				}
				saturated.fetch_add(saturated_local, Ordering::Relaxed);
			});
		}
	})
	.expect("voxel update worker panicked");

	saturated.into_inner()
}

#[allow(clippy::too_many_arguments)]
fn update_block(
	volume: &TsdfVolume,
	coord: BlockCoord,
	block: &mut crate::voxel::VoxelBlock,
	depth: &DepthImage,
	color: Option<&ColorImage>,
	intrinsic: &CameraIntrinsic,
	extrinsic: &Mat4,
	options: &IntegrateOptions,
) -> usize {
	let resolution = volume.resolution as i32;
	let max_weight = options.max_weight();
	let mut saturated = 0usize;

	for a in 0..resolution {
		for b in 0..resolution {
			for c in 0..resolution {
				let local = IVec3::new(a, b, c);
				let world = coord.voxel_center(local, volume.resolution, volume.voxel_size);
				let camera = extrinsic.transform_point3(world);
				if camera.z <= 0.0 {
					continue;
				}

				let (u, row) = intrinsic.project(camera);
				let Some(d) = depth.sample_nearest(u, row) else {
					continue;
				};

				let sdf = d - camera.z;
				if sdf < -volume.sdf_trunc {
					continue;
				}
				let sample = (sdf / volume.sdf_trunc).clamp(-1.0, 1.0);

				let voxel = block.voxel_mut(local);
				let weight = voxel.weight;
				let new_weight = weight + 1.0;
				voxel.tsdf = (voxel.tsdf * weight + sample) / new_weight;
				if let Some(color) = color {
					if let Some(rgb) = color.sample_nearest(u, row) {
						let fused = (voxel.color_vec() * weight + rgb) / new_weight;
						voxel.color = fused.to_array();
					}
				}
				if new_weight > max_weight {
					saturated += 1;
					voxel.weight = max_weight;
				} else {
					voxel.weight = new_weight;
				}
			}
		}
	}

	saturated
}
