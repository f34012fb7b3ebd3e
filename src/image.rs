use glam::{Mat3, Vec3};

use crate::prelude::*;

/// A depth frame in meters, row major, (0, 0) at the top left.
///
/// A sample of 0 or NaN marks an invalid measurement.
pub struct DepthImage {
	data: Vec<f32>,
	width: usize,
	height: usize,
}

impl DepthImage {
	pub fn new(data: Vec<f32>, width: usize, height: usize) -> Result<Self> {
		if data.len() != width * height {
			return Err(Error::invalid(format!(
				"depth buffer holds {} samples, expected {}x{}",
				data.len(),
				width,
				height
			)));
		}
		Ok(DepthImage { data, width, height })
	}

	pub fn width(&self) -> usize {
		self.width
	}

	pub fn height(&self) -> usize {
		self.height
	}

	#[inline]
	pub fn at(&self, u: usize, row: usize) -> f32 {
		self.data[row * self.width + u]
	}

	/// Nearest-neighbor sample; `None` for out-of-bounds or invalid depth.
	#[inline]
	pub fn sample_nearest(&self, u: f32, row: f32) -> Option<f32> {
		let u = u.round();
		let row = row.round();
		if u < 0.0 || row < 0.0 || u >= self.width as f32 || row >= self.height as f32 {
			return None;
		}
		let depth = self.at(u as usize, row as usize);
		depth_valid(depth).then_some(depth)
	}
}

/// RGB companion frame for color fusion, channels in [0, 1].
pub struct ColorImage {
	data: Vec<[f32; 3]>,
	width: usize,
	height: usize,
}

impl ColorImage {
	pub fn new(data: Vec<[f32; 3]>, width: usize, height: usize) -> Result<Self> {
		if data.len() != width * height {
			return Err(Error::invalid(format!(
				"color buffer holds {} samples, expected {}x{}",
				data.len(),
				width,
				height
			)));
		}
		Ok(ColorImage { data, width, height })
	}

	pub fn width(&self) -> usize {
		self.width
	}

	pub fn height(&self) -> usize {
		self.height
	}

	#[inline]
	pub fn sample_nearest(&self, u: f32, row: f32) -> Option<Vec3> {
		let u = u.round();
		let row = row.round();
		if u < 0.0 || row < 0.0 || u >= self.width as f32 || row >= self.height as f32 {
			return None;
		}
		Some(Vec3::from_array(self.data[row as usize * self.width + u as usize]))
	}
}

#[inline]
pub fn depth_valid(depth: f32) -> bool {
	depth.is_finite() && depth > 0.0
}

/// Pinhole camera parameters pulled out of a 3x3 intrinsic matrix.
#[derive(Debug, Clone, Copy)]
pub struct CameraIntrinsic {
	pub fx: f32,
	pub fy: f32,
	pub cx: f32,
	pub cy: f32,
}

impl CameraIntrinsic {
	pub fn new(fx: f32, fy: f32, cx: f32, cy: f32) -> Result<Self> {
		if fx == 0.0 || fy == 0.0 || !fx.is_finite() || !fy.is_finite() {
			return Err(Error::invalid(format!("degenerate focal lengths fx={fx} fy={fy}")));
		}
		if !cx.is_finite() || !cy.is_finite() {
			return Err(Error::invalid("non-finite principal point"));
		}
		Ok(CameraIntrinsic { fx, fy, cx, cy })
	}

	/// Reads [[fx, 0, cx], [0, fy, cy], [0, 0, 1]] out of `matrix`.
	pub fn from_matrix(matrix: &Mat3) -> Result<Self> {
		// glam stores columns, so row-major (r, c) is col(c)[r]
		Self::new(
			matrix.col(0).x,
			matrix.col(1).y,
			matrix.col(2).x,
			matrix.col(2).y,
		)
	}

	/// Pixel ray direction at unit depth.
	#[inline]
	pub fn unproject(&self, u: f32, row: f32) -> Vec3 {
		Vec3::new((u - self.cx) / self.fx, (row - self.cy) / self.fy, 1.0)
	}

	/// Projects a camera-space point with positive depth to pixel space.
	#[inline]
	pub fn project(&self, point: Vec3) -> (f32, f32) {
		(
			self.fx * point.x / point.z + self.cx,
			self.fy * point.y / point.z + self.cy,
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn depth_validity_rules() {
		assert!(depth_valid(0.5));
		assert!(!depth_valid(0.0));
		assert!(!depth_valid(f32::NAN));
		assert!(!depth_valid(f32::INFINITY));
		assert!(!depth_valid(-1.0));
	}

	#[test]
	fn nearest_sampling_rejects_invalid_and_out_of_bounds() {
		let image = DepthImage::new(vec![1.0, 0.0, f32::NAN, 2.0], 2, 2).unwrap();
		assert_eq!(image.sample_nearest(0.2, 0.1), Some(1.0));
		assert_eq!(image.sample_nearest(1.0, 0.0), None); // zero depth
		assert_eq!(image.sample_nearest(0.0, 1.0), None); // nan depth
		assert_eq!(image.sample_nearest(1.4, 1.0), Some(2.0));
		assert_eq!(image.sample_nearest(-1.0, 0.0), None);
		assert_eq!(image.sample_nearest(0.0, 2.0), None);
	}

	#[test]
	fn intrinsic_round_trip_through_matrix() {
		// row-major [[fx, 0, cx], [0, fy, cy], [0, 0, 1]]
		let matrix = Mat3::from_cols_array_2d(&[
			[525.0, 0.0, 0.0],
			[0.0, 525.0, 0.0],
			[319.5, 239.5, 1.0],
		]);
		let intrinsic = CameraIntrinsic::from_matrix(&matrix).unwrap();
		assert_eq!(intrinsic.fx, 525.0);
		assert_eq!(intrinsic.fy, 525.0);
		assert_eq!(intrinsic.cx, 319.5);
		assert_eq!(intrinsic.cy, 239.5);

		let (u, row) = intrinsic.project(intrinsic.unproject(100.0, 50.0) * 2.0);
		assert!((u - 100.0).abs() < 1e-4);
		assert!((row - 50.0).abs() < 1e-4);
	}

	#[test]
	fn zero_focal_length_is_rejected() {
		assert!(CameraIntrinsic::new(0.0, 525.0, 320.0, 240.0).is_err());
		assert!(CameraIntrinsic::new(525.0, 0.0, 320.0, 240.0).is_err());
	}
}
