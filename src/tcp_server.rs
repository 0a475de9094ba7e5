use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use socket2::{Domain, Socket, Type};
use tracing::{debug, error, trace, warn};

use crate::buffer::{BufferSlotPool, DEFAULT_SERVER_POOL_SLOTS, DEFAULT_SERVER_POOL_SLOT_SIZE};
use crate::error::Result;
use crate::pool::SocketsPool;
use crate::socket::{ClosedReason, ReactorSocket, SocketKind};
use crate::tcp_client::TcpClient;

/// Default listen backlog (§6).
pub const DEFAULT_BACKLOG: i32 = 256;

#[derive(Default)]
struct ServerHooks {
	on_client_accepted: Option<Box<dyn FnMut(&Arc<TcpServer>, Arc<TcpClient>) + Send>>,
	on_closed: Option<Box<dyn FnMut(&TcpServer, ClosedReason) + Send>>,
}

/// A nonblocking listening socket. Accepts inbound connections one at a
/// time per readable wake and hands each one a buffer slot drawn from its
/// own receive-buffer pool.
pub struct TcpServer {
	self_weak: Weak<TcpServer>,
	pool: Arc<SocketsPool>,
	fd: RawFd,
	listener: std::net::TcpListener,
	local_addr: SocketAddr,
	recv_buf_slots: Arc<BufferSlotPool>,
	hooks: Mutex<ServerHooks>,
	closed: AtomicBool,
}

impl TcpServer {
	/// Binds and listens on `addr` with `backlog`, drawing accepted clients'
	/// receive buffers from a pool of `slot_count` buffers of `slot_size`
	/// bytes each (lazily allocated).
	pub fn create(
		pool: &Arc<SocketsPool>,
		addr: SocketAddr,
		backlog: i32,
		slot_count: usize,
		slot_size: usize,
	) -> Result<Arc<TcpServer>> {
		let domain = Domain::for_address(addr);
		let socket = Socket::new(domain, Type::STREAM, None)?;
		socket.set_reuse_address(true)?;
		socket.set_nonblocking(true)?;
		socket.bind(&addr.into())?;
		socket.listen(backlog)?;

		let listener: std::net::TcpListener = socket.into();
		let fd = listener.as_raw_fd();
		let local_addr = listener.local_addr()?;
		let recv_buf_slots = BufferSlotPool::new(slot_count, slot_size, false)?;

		let server = Arc::new_cyclic(|weak| TcpServer {
			self_weak: weak.clone(),
			pool: Arc::clone(pool),
			fd,
			listener,
			local_addr,
			recv_buf_slots,
			hooks: Mutex::new(ServerHooks::default()),
			closed: AtomicBool::new(false),
		});

		pool.add(server.clone() as Arc<dyn ReactorSocket>);
		pool.set_read_interest(fd, true);
		debug!(fd, %local_addr, "tcp server listening");
		Ok(server)
	}

	/// Convenience constructor using the crate's default backlog and
	/// receive-buffer pool sizing (§6).
	pub fn create_with_defaults(pool: &Arc<SocketsPool>, addr: SocketAddr) -> Result<Arc<TcpServer>> {
		Self::create(
			pool,
			addr,
			DEFAULT_BACKLOG,
			DEFAULT_SERVER_POOL_SLOTS,
			DEFAULT_SERVER_POOL_SLOT_SIZE,
		)
	}

	pub fn raw_handle(&self) -> RawFd {
		self.fd
	}

	pub fn local_addr(&self) -> SocketAddr {
		self.local_addr
	}

	/// Installs the accept hook. Called with the server and the newly
	/// accepted client, already registered with the pool but with no
	/// read/write interest armed yet beyond what this hook arms.
	pub fn on_client_accepted(&self, f: impl FnMut(&Arc<TcpServer>, Arc<TcpClient>) + Send + 'static) {
		self.hooks.lock().unwrap().on_client_accepted = Some(Box::new(f));
	}

	pub fn on_closed(&self, f: impl FnMut(&TcpServer, ClosedReason) + Send + 'static) {
		self.hooks.lock().unwrap().on_closed = Some(Box::new(f));
	}

	pub fn close(&self) -> bool {
		self.close_with_reason(ClosedReason::ClosedByHost)
	}

	fn close_with_reason(&self, reason: ClosedReason) -> bool {
		if self.closed.swap(true, Ordering::SeqCst) {
			return false;
		}
		self.pool.remove(self.fd);
		debug!(fd = self.fd, ?reason, "tcp server closed");
		let mut hooks = self.hooks.lock().unwrap();
		if let Some(cb) = hooks.on_closed.as_mut() {
			cb(self, reason);
		}
		true
	}

	fn accept_one(&self) {
		let this = match self.self_weak.upgrade() {
			Some(this) => this,
			None => return,
		};

		let (stream, client_addr) = match self.listener.accept() {
			Ok(pair) => pair,
			Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
			Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return,
			Err(e) => {
				warn!(fd = self.fd, error = %e, "accept failed");
				return;
			},
		};

		let slot = match self.recv_buf_slots.acquire() {
			Some(slot) => slot,
			None => {
				warn!(fd = self.fd, "accept buffer pool exhausted, dropping accepted connection");
				drop(stream);
				return;
			},
		};

		let client = match TcpClient::from_accepted(Arc::clone(&self.pool), stream, self.local_addr, client_addr, slot) {
			Ok(client) => client,
			Err(e) => {
				warn!(fd = self.fd, error = %e, "failed to prepare accepted connection");
				return;
			},
		};

		trace!(fd = self.fd, client_fd = client.raw_handle(), %client_addr, "accepted connection");

		let mut hooks = self.hooks.lock().unwrap();
		let Some(cb) = hooks.on_client_accepted.as_mut() else {
			drop(hooks);
			client.close();
			return;
		};

		let result = panic::catch_unwind(AssertUnwindSafe(|| cb(&this, Arc::clone(&client))));
		drop(hooks);
		if let Err(e) = result {
			error!(fd = self.fd, client_fd = client.raw_handle(), "on_client_accepted panicked; closing accepted client");
			ReactorSocket::close(&*client, ClosedReason::Error);
			panic::resume_unwind(e);
		}

		self.pool.set_write_interest(client.raw_handle(), true);
	}
}

impl ReactorSocket for TcpServer {
	fn raw_handle(&self) -> RawFd {
		self.fd
	}

	fn kind(&self) -> SocketKind {
		SocketKind::TcpServer
	}

	fn expire_deadline(&self) -> Option<Instant> {
		None
	}

	fn on_ready_for_reading(&self, _pool: &Arc<SocketsPool>) {
		self.accept_one();
	}

	fn close(&self, reason: ClosedReason) -> bool {
		self.close_with_reason(reason)
	}
}
