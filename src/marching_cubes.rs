use array_init::array_init;
use glam::{IVec3, Vec3};
use rustc_hash::FxHashMap;

use crate::mesh::TriangleMesh;
use crate::prelude::*;
use crate::tables::{CORNER_SHIFT, EDGE_SHIFT, EDGE_TABLE, TRI_TABLE};
use crate::volume::TsdfVolume;

const NO_VERTEX: u32 = u32::MAX;

// pass 1 output for one block: vertex attributes plus the R^3 x 3 table
// mapping (voxel, forward axis) to the local vertex index on that edge
struct BlockVertices {
	edge_vertex: Vec<u32>,
	positions: Vec<Vec3>,
	normals: Vec<Vec3>,
	colors: Vec<Vec3>,
}

/// Extracts the zero isosurface of the volume as a triangle mesh.
///
/// Both passes run block parallel over the allocated blocks in sorted
/// coordinate order, so repeated extraction of an unmodified volume is
/// byte identical. Cubes touching an absent neighbor block or an
/// unobserved corner are skipped; cross-block edges resolve into the
/// neighbor's vertex table so boundary triangles share vertex indices.
pub(crate) fn extract(volume: &TsdfVolume) -> TriangleMesh {
	let entries = volume.sorted_entries();
	if entries.is_empty() {
		return TriangleMesh::default();
	}

	let block_of: FxHashMap<BlockCoord, usize> = entries
		.iter()
		.enumerate()
		.map(|(index, (coord, _))| (*coord, index))
		.collect();

	// pass 1: vertex allocation
	let fragments = parallel_map(entries.len(), |index| {
		let (coord, slot) = entries[index];
		allocate_vertices(volume, coord, slot)
	});

	// prefix offsets stitch the per-block buffers into one index space
	let mut offsets = Vec::with_capacity(fragments.len());
	let mut total = 0u32;
	for fragment in &fragments {
		offsets.push(total);
		total += fragment.positions.len() as u32;
	}

	// pass 2: triangle emission
	let triangle_lists = parallel_map(entries.len(), |index| {
		let (coord, slot) = entries[index];
		emit_triangles(volume, coord, slot, &block_of, &fragments, &offsets)
	});

	let mut mesh = TriangleMesh {
		vertices: Vec::with_capacity(total as usize),
		triangles: Vec::new(),
		normals: Vec::with_capacity(total as usize),
		colors: Vec::with_capacity(total as usize),
	};
	for fragment in fragments {
		mesh.vertices.extend(fragment.positions);
		mesh.normals.extend(fragment.normals);
		mesh.colors.extend(fragment.colors);
	}
	for list in triangle_lists {
		mesh.triangles.extend(list);
	}

	debug!(
		"marching cubes: {} vertices, {} triangles from {} blocks",
		mesh.vertex_count(),
		mesh.triangle_count(),
		entries.len()
	);
	mesh
}

// order-preserving parallel map over 0..count
fn parallel_map<T, F>(count: usize, f: F) -> Vec<T>
where
	T: Send,
	F: Fn(usize) -> T + Sync,
{
	if count == 0 {
		return Vec::new();
	}
	let workers = num_cpus::get().min(count).max(1);
	let chunk_len = count.div_ceil(workers);

	crossbeam::thread::scope(|scope| {
		let handles: Vec<_> = (0..count)
			.step_by(chunk_len)
			.map(|start| {
				let f = &f;
				scope.spawn(move |_| {
					(start..(start + chunk_len).min(count)).map(f).collect::<Vec<_>>()
				})
			})
			.collect();

		handles
			.into_iter()
			.flat_map(|handle| handle.join().expect("extraction worker panicked"))
			.collect()
	})
	.expect("extraction scope panicked")
}

fn allocate_vertices(volume: &TsdfVolume, coord: BlockCoord, slot: BlockIndex) -> BlockVertices {
	let resolution = volume.resolution;
	let block = volume.pool.get(slot);
	let mut out = BlockVertices {
		edge_vertex: vec![NO_VERTEX; resolution * resolution * resolution * 3],
		positions: Vec::new(),
		normals: Vec::new(),
		colors: Vec::new(),
	};

	for a in 0..resolution as i32 {
		for b in 0..resolution as i32 {
			for c in 0..resolution as i32 {
				let local = IVec3::new(a, b, c);
				let voxel = block.voxel(local);
				if !voxel.is_observed() {
					continue;
				}

				for axis in 0..3 {
					let mut step = IVec3::ZERO;
					step[axis] = 1;
					let forward = local + step;
					let neighbor = if block.contains_local(forward) {
						Some(block.voxel(forward))
					} else {
						volume.voxel_at(coord, forward)
					};
					// an absent neighbor makes the edge unavailable
					let Some(neighbor) = neighbor else {
						continue;
					};
					if !neighbor.is_observed() || voxel.tsdf * neighbor.tsdf >= 0.0 {
						continue;
					}

					let t = voxel.tsdf / (voxel.tsdf - neighbor.tsdf);
					let here = coord.voxel_center(local, resolution, volume.voxel_size);
					let there = coord.voxel_center(forward, resolution, volume.voxel_size);

					let index = out.positions.len() as u32;
					out.positions.push(here.lerp(there, t));
					let gradient_here = volume.tsdf_gradient(coord, local);
					let gradient_there = volume.tsdf_gradient(coord, forward);
					out.normals
						.push(gradient_here.lerp(gradient_there, t).normalize_or_zero());
					out.colors.push(voxel.color_vec().lerp(neighbor.color_vec(), t));
					out.edge_vertex[block.linear_index(local) * 3 + axis] = index;
				}
			}
		}
	}

	out
}

fn emit_triangles(
	volume: &TsdfVolume,
	coord: BlockCoord,
	slot: BlockIndex,
	block_of: &FxHashMap<BlockCoord, usize>,
	fragments: &[BlockVertices],
	offsets: &[u32],
) -> Vec<[u32; 3]> {
	let resolution = volume.resolution as i32;
	let block = volume.pool.get(slot);
	let mut triangles = Vec::new();

	for a in 0..resolution {
		for b in 0..resolution {
			for c in 0..resolution {
				let local = IVec3::new(a, b, c);

				let corners: [Option<Voxel>; 8] = array_init(|bit| {
					let shift = CORNER_SHIFT[bit];
					let corner = local + IVec3::new(shift[0], shift[1], shift[2]);
					let voxel = if block.contains_local(corner) {
						Some(block.voxel(corner))
					} else {
						volume.voxel_at(coord, corner)
					};
					voxel.filter(|voxel| voxel.is_observed())
				});
				// a cube with any absent or unobserved corner emits nothing
				if corners.iter().any(|corner| corner.is_none()) {
					continue;
				}

				let mut cube_index = 0usize;
				for (bit, corner) in corners.iter().enumerate() {
					if corner.unwrap().tsdf < 0.0 {
						cube_index |= 1 << bit;
					}
				}
				if EDGE_TABLE[cube_index] == 0 {
					continue;
				}

				let row = &TRI_TABLE[cube_index];
				let mut cursor = 0;
				'triangle: while cursor + 2 < row.len() && row[cursor] >= 0 {
					let mut indices = [0u32; 3];
					for (corner_index, &edge) in row[cursor..cursor + 3].iter().enumerate() {
						let shift = EDGE_SHIFT[edge as usize];
						let owner = local + IVec3::new(shift[0], shift[1], shift[2]);
						let axis = shift[3] as usize;

						let (owner_coord, wrapped) = rebase(coord, owner, resolution);
						let Some(&fragment) = block_of.get(&owner_coord) else {
							cursor += 3;
							continue 'triangle;
						};
						let linear = ((wrapped.x * resolution + wrapped.y) * resolution + wrapped.z) as usize;
						let vertex = fragments[fragment].edge_vertex[linear * 3 + axis];
						if vertex == NO_VERTEX {
							cursor += 3;
							continue 'triangle;
						}
						indices[corner_index] = offsets[fragment] + vertex;
					}

					// swap so the winding is counter-clockwise seen from the
					// positive-tsdf side
					triangles.push([indices[0], indices[2], indices[1]]);
					cursor += 3;
				}
			}
		}
	}

	triangles
}

// shifts an out-of-range local coordinate into its owning block
fn rebase(coord: BlockCoord, local: IVec3, resolution: i32) -> (BlockCoord, IVec3) {
	let shift = IVec3::new(
		local.x.div_euclid(resolution),
		local.y.div_euclid(resolution),
		local.z.div_euclid(resolution),
	);
	let wrapped = IVec3::new(
		local.x.rem_euclid(resolution),
		local.y.rem_euclid(resolution),
		local.z.rem_euclid(resolution),
	);
	(BlockCoord(coord.0 + shift), wrapped)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::mesh::Geometry;
	use crate::test_scenes::{identity_extrinsic, intrinsic_matrix, plane_depth, sphere_depth, TestCamera};
	use crate::volume::{Device, TsdfVolume};
	use rustc_hash::FxHashMap;

	fn sphere_volume() -> TsdfVolume {
		let mut volume = TsdfVolume::new(0.01, 0.04, 8, 4096, Device::Cpu).unwrap();
		let camera = TestCamera::default();
		let depth = sphere_depth(&camera, Vec3::new(0.0, 0.0, 0.5), 0.2);
		volume
			.integrate(&depth, &intrinsic_matrix(&camera), &identity_extrinsic())
			.unwrap();
		volume
	}

	#[test]
	fn empty_volume_extracts_empty_mesh() {
		let volume = TsdfVolume::new(0.01, 0.04, 8, 64, Device::Cpu).unwrap();
		let mesh = volume.marching_cubes();
		assert!(mesh.is_empty());
		assert_eq!(mesh.triangle_count(), 0);
	}

	#[test]
	fn sphere_mesh_lies_on_the_sphere() {
		let volume = sphere_volume();
		let mesh = volume.marching_cubes();
		let center = Vec3::new(0.0, 0.0, 0.5);
		let voxel_size = volume.voxel_size();

		assert!(mesh.vertex_count() > 100, "{} vertices", mesh.vertex_count());
		assert!(mesh.triangle_count() > 100);

		let mut error_sum = 0.0f32;
		for vertex in &mesh.vertices {
			let error = ((*vertex - center).length() - 0.2).abs();
			assert!(error <= 2.0 * voxel_size, "vertex {vertex:?} off surface by {error}");
			error_sum += error;
		}
		assert!(error_sum / mesh.vertex_count() as f32 <= voxel_size / 2.0);

		// indices reference allocated vertices, no degenerate triangles
		for triangle in &mesh.triangles {
			assert!(triangle.iter().all(|&i| (i as usize) < mesh.vertex_count()));
			assert!(triangle[0] != triangle[1] && triangle[1] != triangle[2] && triangle[0] != triangle[2]);
		}

		// normals point outward on the visible cap
		let mut outward = 0usize;
		for (vertex, normal) in mesh.vertices.iter().zip(&mesh.normals) {
			if normal.dot((*vertex - center).normalize()) > 0.5 {
				outward += 1;
			}
		}
		assert!(outward as f32 > 0.9 * mesh.vertex_count() as f32);
	}

	#[test]
	fn extraction_is_deterministic() {
		let volume = sphere_volume();
		let first = volume.marching_cubes();
		let second = volume.marching_cubes();
		assert_eq!(first.vertices, second.vertices);
		assert_eq!(first.triangles, second.triangles);
		assert_eq!(first.normals, second.normals);
		assert_eq!(first.colors, second.colors);
	}

	#[test]
	fn surface_points_agree_with_the_sphere() {
		let volume = sphere_volume();
		let cloud = volume.extract_surface_points();
		let center = Vec3::new(0.0, 0.0, 0.5);

		assert!(cloud.len() > 100);
		for (position, normal) in cloud.positions.iter().zip(&cloud.normals) {
			let error = ((*position - center).length() - 0.2).abs();
			assert!(error <= 2.0 * volume.voxel_size());
			assert!(normal.length() > 0.0);
		}
	}

	#[test]
	fn two_view_reconstruction_pipeline() -> anyhow::Result<()> {
		let _ = pretty_env_logger::try_init();

		let mut volume = TsdfVolume::new(0.01, 0.04, 8, 4096, Device::Cpu)?;
		let camera = TestCamera::default();
		let center = Vec3::new(0.0, 0.0, 0.5);
		let intrinsic = intrinsic_matrix(&camera);

		// first view from the origin, second from a camera shifted 5 cm
		// along +x (world to camera translates the other way)
		let first = sphere_depth(&camera, center, 0.2);
		volume.integrate(&first, &intrinsic, &identity_extrinsic())?;

		let shifted = glam::Mat4::from_translation(Vec3::new(-0.05, 0.0, 0.0));
		let second = sphere_depth(&camera, center + Vec3::new(-0.05, 0.0, 0.0), 0.2);
		volume.integrate(&second, &intrinsic, &shifted)?;

		let mesh = volume.marching_cubes();
		assert!(mesh.vertex_count() > 100);
		for vertex in &mesh.vertices {
			let error = ((*vertex - center).length() - 0.2).abs();
			assert!(error <= 2.0 * volume.voxel_size(), "vertex {vertex:?} off by {error}");
		}

		// voxels seen by both views fused two observations
		let doubly_observed = volume
			.sorted_entries()
			.iter()
			.flat_map(|(_, slot)| volume.pool.get(*slot).as_slice())
			.filter(|voxel| voxel.weight == 2.0)
			.count();
		assert!(doubly_observed > 0);
		Ok(())
	}

	#[test]
	fn plane_mesh_is_continuous_across_block_boundaries() {
		let mut volume = TsdfVolume::new(0.01, 0.04, 8, 4096, Device::Cpu).unwrap();
		let camera = TestCamera::narrow();
		let depth = plane_depth(&camera, 1.0);
		volume
			.integrate(&depth, &intrinsic_matrix(&camera), &identity_extrinsic())
			.unwrap();
		let mesh = volume.marching_cubes();
		assert!(mesh.triangle_count() > 0);

		// every vertex sits on the plane
		for vertex in &mesh.vertices {
			assert!((vertex.z - 1.0).abs() < 1e-3, "vertex {vertex:?}");
		}

		// vertices on shared block edges are emitted once, never duplicated
		// per block
		let mut seen = FxHashMap::default();
		for (index, vertex) in mesh.vertices.iter().enumerate() {
			let key = (
				(vertex.x * 1e5).round() as i64,
				(vertex.y * 1e5).round() as i64,
				(vertex.z * 1e5).round() as i64,
			);
			if let Some(previous) = seen.insert(key, index) {
				panic!("vertices {previous} and {index} duplicate position {vertex:?}");
			}
		}

		// no gaps: every triangle edge strictly inside the well-observed
		// interior is shared by exactly two triangles, also across block
		// boundaries
		let mut edge_use: FxHashMap<(u32, u32), usize> = FxHashMap::default();
		for triangle in &mesh.triangles {
			for (from, to) in [(0, 1), (1, 2), (2, 0)] {
				let a = triangle[from].min(triangle[to]);
				let b = triangle[from].max(triangle[to]);
				*edge_use.entry((a, b)).or_insert(0) += 1;
			}
		}
		for ((a, b), count) in edge_use {
			assert!(count <= 2, "edge ({a}, {b}) used {count} times");
			if count == 1 {
				let inside = |v: &Vec3| v.x.abs() < 0.2 && v.y.abs() < 0.2;
				assert!(
					!(inside(&mesh.vertices[a as usize]) && inside(&mesh.vertices[b as usize])),
					"interior gap between vertices {a} and {b}"
				);
			}
		}
	}
}
