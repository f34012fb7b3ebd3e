use bytemuck::{Pod, Zeroable};
use enum_dispatch::enum_dispatch;
use glam::{Mat4, Vec3};

use crate::volume::TsdfVolume;

/// Axis-aligned bounding box as a corner and an extent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
	pub position: Vec3,
	pub size: Vec3,
}

impl Aabb {
	pub fn new(position: Vec3, size: Vec3) -> Self {
		Aabb { position, size }
	}

	pub fn end(&self) -> Vec3 {
		self.position + self.size
	}

	/// Smallest box around a set of points; `None` when the set is empty.
	pub fn from_points(points: &[Vec3]) -> Option<Self> {
		let first = *points.first()?;
		let (min, max) = points.iter().fold((first, first), |(min, max), p| {
			(min.min(*p), max.max(*p))
		});
		Some(Aabb::new(min, max - min))
	}
}

/// Mesh vertex attributes laid out for direct upload by callers.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct SurfaceVertex {
	pub position: [f32; 3],
	pub normal: [f32; 3],
	pub color: [f32; 3],
}

/// Common capability surface of the concrete geometry outputs.
#[enum_dispatch]
pub trait Geometry {
	fn is_empty(&self) -> bool;
	fn bounding_box(&self) -> Option<Aabb>;
}

/// Tag over the concrete geometry variants.
#[enum_dispatch(Geometry)]
pub enum GeometryKind {
	PointCloud,
	TriangleMesh,
	TsdfVolume,
}

/// Oriented surface samples extracted from the volume.
#[derive(Debug, Clone, Default)]
pub struct PointCloud {
	pub positions: Vec<Vec3>,
	pub normals: Vec<Vec3>,
	pub colors: Vec<Vec3>,
}

impl PointCloud {
	pub fn len(&self) -> usize {
		self.positions.len()
	}

	/// Applies a rigid transform to positions and normals in place.
	pub fn transform(&mut self, transform: &Mat4) {
		for position in self.positions.iter_mut() {
			*position = transform.transform_point3(*position);
		}
		for normal in self.normals.iter_mut() {
			*normal = transform.transform_vector3(*normal).normalize_or_zero();
		}
	}
}

impl Geometry for PointCloud {
	fn is_empty(&self) -> bool {
		self.positions.is_empty()
	}

	fn bounding_box(&self) -> Option<Aabb> {
		Aabb::from_points(&self.positions)
	}
}

/// Indexed triangle mesh with per-vertex normals and colors.
#[derive(Debug, Clone, Default)]
pub struct TriangleMesh {
	pub vertices: Vec<Vec3>,
	pub triangles: Vec<[u32; 3]>,
	pub normals: Vec<Vec3>,
	pub colors: Vec<Vec3>,
}

impl TriangleMesh {
	pub fn vertex_count(&self) -> usize {
		self.vertices.len()
	}

	pub fn triangle_count(&self) -> usize {
		self.triangles.len()
	}

	pub fn transform(&mut self, transform: &Mat4) {
		for vertex in self.vertices.iter_mut() {
			*vertex = transform.transform_point3(*vertex);
		}
		for normal in self.normals.iter_mut() {
			*normal = transform.transform_vector3(*normal).normalize_or_zero();
		}
	}

	/// Interleaved vertex buffer for upload.
	pub fn surface_vertices(&self) -> Vec<SurfaceVertex> {
		(0..self.vertices.len())
			.map(|i| SurfaceVertex {
				position: self.vertices[i].to_array(),
				normal: self.normals.get(i).copied().unwrap_or(Vec3::ZERO).to_array(),
				color: self.colors.get(i).copied().unwrap_or(Vec3::ZERO).to_array(),
			})
			.collect()
	}
}

impl Geometry for TriangleMesh {
	fn is_empty(&self) -> bool {
		self.vertices.is_empty()
	}

	fn bounding_box(&self) -> Option<Aabb> {
		Aabb::from_points(&self.vertices)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn bounding_box_over_points() {
		let cloud = PointCloud {
			positions: vec![
				Vec3::new(-1.0, 0.0, 2.0),
				Vec3::new(3.0, -2.0, 2.5),
				Vec3::new(0.0, 1.0, 1.0),
			],
			..Default::default()
		};
		let aabb = cloud.bounding_box().unwrap();
		assert_eq!(aabb.position, Vec3::new(-1.0, -2.0, 1.0));
		assert_eq!(aabb.end(), Vec3::new(3.0, 1.0, 2.5));

		assert!(PointCloud::default().bounding_box().is_none());
	}

	#[test]
	fn transform_moves_positions_and_rotates_normals() {
		let mut mesh = TriangleMesh {
			vertices: vec![Vec3::new(1.0, 0.0, 0.0)],
			triangles: vec![],
			normals: vec![Vec3::X],
			colors: vec![],
		};
		// quarter turn around z plus a translation
		let transform =
			Mat4::from_translation(Vec3::new(0.0, 0.0, 5.0)) * Mat4::from_rotation_z(std::f32::consts::FRAC_PI_2);
		mesh.transform(&transform);
		assert!((mesh.vertices[0] - Vec3::new(0.0, 1.0, 5.0)).length() < 1e-5);
		assert!((mesh.normals[0] - Vec3::Y).length() < 1e-5);
	}

	#[test]
	fn geometry_dispatch_over_variants() {
		let kind: GeometryKind = PointCloud::default().into();
		assert!(kind.is_empty());
		assert!(kind.bounding_box().is_none());
	}
}
