use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Instant;

use crate::pool::SocketsPool;

/// Why a socket was torn down. Delivered exactly once to `on_closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosedReason {
	Error = 0,
	ClosedByHost = 1,
	ClosedByPeer = 2,
	Timeout = 3,
}

/// Tag identifying a socket's concrete kind, for logging and debugging only —
/// dispatch never matches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
	TcpServer,
	TcpClient,
	Udp,
}

/// The capability set the pool needs from any socket it owns.
///
/// Implementors perform exactly one nonblocking I/O step per hook
/// invocation and must not block; the pool serializes calls to a given
/// socket's hooks via its `handling` claim, so implementations do not need
/// to protect against concurrent dispatch of themselves — only against
/// concurrent calls from the async-op entry points the owning handle
/// exposes to user code.
pub(crate) trait ReactorSocket: Send + Sync {
	fn raw_handle(&self) -> RawFd;

	fn kind(&self) -> SocketKind;

	fn expire_deadline(&self) -> Option<Instant>;

	fn on_ready_for_reading(&self, _pool: &Arc<SocketsPool>) {}

	fn on_ready_for_writing(&self, _pool: &Arc<SocketsPool>) {}

	fn on_exceptional_condition(&self, _pool: &Arc<SocketsPool>) {
		// Default: treat any exceptional condition (POLLERR/POLLHUP/POLLNVAL)
		// as a fatal I/O error on the socket.
		self.close(ClosedReason::Error);
	}

	/// Idempotent teardown. Returns `true` the first time it runs for this
	/// socket, `false` on every subsequent call.
	fn close(&self, reason: ClosedReason) -> bool;
}
