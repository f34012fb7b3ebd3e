//! Synthetic camera frames for the end-to-end tests.

use glam::{Mat3, Mat4, Vec3};

use crate::image::DepthImage;

pub struct TestCamera {
	pub width: usize,
	pub height: usize,
	pub fx: f32,
	pub fy: f32,
	pub cx: f32,
	pub cy: f32,
}

impl Default for TestCamera {
	// kinect-like pinhole
	fn default() -> Self {
		TestCamera {
			width: 640,
			height: 480,
			fx: 525.0,
			fy: 525.0,
			cx: 319.5,
			cy: 239.5,
		}
	}
}

impl TestCamera {
	// low-resolution narrow-fov variant for tests that integrate many
	// frames; the wide default stays for geometric accuracy checks
	pub fn narrow() -> Self {
		TestCamera {
			width: 80,
			height: 60,
			fx: 120.0,
			fy: 120.0,
			cx: 39.5,
			cy: 29.5,
		}
	}

	fn render<F: Fn(Vec3) -> f32>(&self, depth_of_ray: F) -> DepthImage {
		let mut data = vec![0.0f32; self.width * self.height];
		for row in 0..self.height {
			for u in 0..self.width {
				let ray = Vec3::new(
					(u as f32 - self.cx) / self.fx,
					(row as f32 - self.cy) / self.fy,
					1.0,
				);
				data[row * self.width + u] = depth_of_ray(ray);
			}
		}
		DepthImage::new(data, self.width, self.height).unwrap()
	}
}

/// Row-major [[fx, 0, cx], [0, fy, cy], [0, 0, 1]] as a glam matrix.
pub fn intrinsic_matrix(camera: &TestCamera) -> Mat3 {
	Mat3::from_cols(
		Vec3::new(camera.fx, 0.0, 0.0),
		Vec3::new(0.0, camera.fy, 0.0),
		Vec3::new(camera.cx, camera.cy, 1.0),
	)
}

pub fn identity_extrinsic() -> Mat4 {
	Mat4::IDENTITY
}

/// Depth frame of a fronto-parallel plane at distance `z`.
pub fn plane_depth(camera: &TestCamera, z: f32) -> DepthImage {
	camera.render(|_| z)
}

/// Depth frame of a sphere; pixels whose ray misses it are invalid.
pub fn sphere_depth(camera: &TestCamera, center: Vec3, radius: f32) -> DepthImage {
	camera.render(|ray| {
		// solve |z * ray - center|^2 = r^2 for the near intersection
		let a = ray.length_squared();
		let b = -2.0 * ray.dot(center);
		let c = center.length_squared() - radius * radius;
		let discriminant = b * b - 4.0 * a * c;
		if discriminant < 0.0 {
			return 0.0;
		}
		let z = (-b - discriminant.sqrt()) / (2.0 * a);
		if z > 0.0 {
			z
		} else {
			0.0
		}
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn sphere_depth_hits_the_front_surface() {
		let camera = TestCamera::default();
		let center = Vec3::new(0.0, 0.0, 0.5);
		let depth = sphere_depth(&camera, center, 0.2);

		// central pixel looks straight at the near pole
		let d = depth.at(320, 240);
		assert!((d - 0.3).abs() < 1e-3, "central depth {d}");

		// corner rays miss the sphere entirely
		assert_eq!(depth.at(0, 0), 0.0);
	}
}
