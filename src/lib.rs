//! Scalable sparse TSDF volume reconstruction.
//!
//! Depth frames with known intrinsics and per-frame extrinsics are fused
//! into a block-allocated truncated signed distance field; surfaces come
//! back out as point clouds or marching cubes triangle meshes.

#[macro_use]
extern crate log;

mod error;
mod types;
mod image;
mod voxel;
mod pool;
mod hashmap;
mod volume;
mod integrate;
mod mesh;
mod tables;
mod marching_cubes;
pub mod prelude;

#[cfg(test)]
mod test_scenes;

pub use error::{Error, Result};
pub use types::{BlockCoord, BlockIndex};
pub use image::{CameraIntrinsic, ColorImage, DepthImage};
pub use voxel::{Voxel, VoxelBlock};
pub use pool::BlockPool;
pub use hashmap::{BulkInsert, HashProfile, SpatialHashmap};
pub use volume::{ActiveMode, Device, TsdfVolume};
pub use integrate::{IntegrateOptions, DEFAULT_MAX_WEIGHT};
pub use mesh::{Aabb, Geometry, GeometryKind, PointCloud, SurfaceVertex, TriangleMesh};
