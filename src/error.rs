use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Recoverable failures surfaced at the public api boundary.
///
/// Broken internal invariants (double free of a pool slot, torn bucket
/// entries) are programming errors and panic instead of returning here.
#[derive(Debug, Error)]
pub enum Error {
	#[error("invalid argument: {0}")]
	InvalidArgument(String),

	#[error("block pool out of capacity ({capacity} blocks)")]
	OutOfCapacity { capacity: usize },
}

impl Error {
	pub fn invalid(message: impl Into<String>) -> Self {
		Error::InvalidArgument(message.into())
	}
}
