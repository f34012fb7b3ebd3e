use std::hash::BuildHasherDefault;

use dashmap::DashSet;
use rustc_hash::FxHasher;

pub use crate::error::{Error, Result};
pub use crate::types::{BlockCoord, BlockIndex};
pub use crate::voxel::Voxel;

pub type FxDashSet<K> = DashSet<K, BuildHasherDefault<FxHasher>>;
