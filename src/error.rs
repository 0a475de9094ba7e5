use std::io;

/// Errors surfaced by the reactor's constructors and async-op entry points.
///
/// This enum never represents a peer-driven condition (disconnect, timeout) —
/// those are [`crate::socket::ClosedReason`] values delivered to `on_closed`,
/// not a `Result::Err`.
#[derive(Debug, thiserror::Error)]
pub enum ReactorError {
	#[error("buffer size must be at least {min} bytes, got {got}")]
	InvalidBufferSize { got: usize, min: usize },

	#[error("buffer slot pool exhausted")]
	PoolExhausted,

	#[error("payload must be nonempty")]
	EmptyPayload,

	#[error("requested read size {requested} exceeds buffer slot capacity {capacity}")]
	ReadSizeExceedsBuffer { requested: usize, capacity: usize },

	#[error("socket is not registered with a pool")]
	NotRegistered,

	#[error(transparent)]
	Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ReactorError>;
