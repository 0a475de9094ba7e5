use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use socket2::{Domain, Socket, Type};
use tracing::{debug, trace};

use crate::buffer::BufferSlot;
use crate::error::{ReactorError, Result};
use crate::pool::SocketsPool;
use crate::socket::{ClosedReason, ReactorSocket, SocketKind};

/// Default datagram receive buffer size (§4.5/§6: 4096 bytes).
pub const DEFAULT_DATAGRAM_BUF_LEN: usize = 4096;

#[derive(Default)]
struct UdpHooks {
	on_recv: Option<Box<dyn FnMut(&UdpEndpoint, &[u8], SocketAddr) + Send>>,
	on_fails_to_send: Option<Box<dyn FnMut(&UdpEndpoint, &[u8], SocketAddr) + Send>>,
	on_can_send: Option<Box<dyn FnMut(&UdpEndpoint) + Send>>,
	on_closed: Option<Box<dyn FnMut(&UdpEndpoint, ClosedReason) + Send>>,
}

struct UdpState {
	socket: std::net::UdpSocket,
	outbound: VecDeque<(Vec<u8>, SocketAddr)>,
}

/// A nonblocking UDP endpoint. Datagrams to send are queued and drained as
/// the socket reports writable; arbitrary numbers of peers may be
/// addressed from a single bound endpoint.
///
/// When created without a `local_addr`, the endpoint is a send-only client:
/// it has no receive buffer slot and never arms read interest, matching the
/// source's "unbound" UDP socket used purely to fire datagrams at peers.
pub struct UdpEndpoint {
	pool: Arc<SocketsPool>,
	fd: RawFd,
	local_addr: Option<SocketAddr>,
	buffer: Option<BufferSlot>,
	state: Mutex<UdpState>,
	hooks: Mutex<UdpHooks>,
	closed: AtomicBool,
}

impl UdpEndpoint {
	/// Creates the endpoint. If `local_addr` is provided, binds to it,
	/// allocates a receive buffer slot, and arms read interest; otherwise the
	/// endpoint is send-only. Write interest is always armed. When
	/// `broadcast` is set, `SO_BROADCAST` is enabled so datagrams may be sent
	/// to a broadcast address.
	pub fn create(
		pool: &Arc<SocketsPool>,
		local_addr: Option<SocketAddr>,
		recv_buf_len: usize,
		broadcast: bool,
	) -> Result<Arc<UdpEndpoint>> {
		let domain = local_addr.map(Domain::for_address).unwrap_or(Domain::IPV4);
		let socket = Socket::new(domain, Type::DGRAM, None)?;
		socket.set_nonblocking(true)?;
		if broadcast {
			socket.set_broadcast(true)?;
		}

		let buffer = match local_addr {
			Some(addr) => {
				socket.bind(&addr.into())?;
				let size = recv_buf_len.max(crate::buffer::MIN_SLOT_SIZE);
				let private_pool = crate::buffer::BufferSlotPool::new(1, size, true)?;
				Some(private_pool.acquire().expect("freshly created single-slot pool has a free slot"))
			},
			None => None,
		};

		let socket: std::net::UdpSocket = socket.into();
		let fd = socket.as_raw_fd();
		let bound_addr = local_addr.map(|_| socket.local_addr()).transpose()?;

		let endpoint = Arc::new(UdpEndpoint {
			pool: Arc::clone(pool),
			fd,
			local_addr: bound_addr,
			buffer,
			state: Mutex::new(UdpState {
				socket,
				outbound: VecDeque::new(),
			}),
			hooks: Mutex::new(UdpHooks::default()),
			closed: AtomicBool::new(false),
		});

		pool.add(endpoint.clone() as Arc<dyn ReactorSocket>);
		if bound_addr.is_some() {
			pool.set_read_interest(fd, true);
		}
		pool.set_write_interest(fd, true);
		debug!(fd, ?bound_addr, "udp endpoint created");
		Ok(endpoint)
	}

	/// Binds to `addr` with the crate's default receive buffer length.
	/// Convenience wrapper around [`UdpEndpoint::create`] for the common
	/// bound-receiver case.
	pub fn bind(pool: &Arc<SocketsPool>, addr: SocketAddr, broadcast: bool, recv_buf_len: usize) -> Result<Arc<UdpEndpoint>> {
		Self::create(pool, Some(addr), recv_buf_len, broadcast)
	}

	pub fn raw_handle(&self) -> RawFd {
		self.fd
	}

	pub fn local_addr(&self) -> Option<SocketAddr> {
		self.local_addr
	}

	pub fn on_recv(&self, f: impl FnMut(&UdpEndpoint, &[u8], SocketAddr) + Send + 'static) {
		self.hooks.lock().unwrap().on_recv = Some(Box::new(f));
	}

	pub fn on_fails_to_send(&self, f: impl FnMut(&UdpEndpoint, &[u8], SocketAddr) + Send + 'static) {
		self.hooks.lock().unwrap().on_fails_to_send = Some(Box::new(f));
	}

	pub fn on_can_send(&self, f: impl FnMut(&UdpEndpoint) + Send + 'static) {
		self.hooks.lock().unwrap().on_can_send = Some(Box::new(f));
	}

	pub fn on_closed(&self, f: impl FnMut(&UdpEndpoint, ClosedReason) + Send + 'static) {
		self.hooks.lock().unwrap().on_closed = Some(Box::new(f));
	}

	/// Queues `data` for delivery to `to` and arms write interest. The queue
	/// is unbounded; backpressure is the caller's responsibility.
	pub fn async_send_datagram(&self, data: &[u8], to: SocketAddr) -> Result<()> {
		if data.is_empty() {
			return Err(ReactorError::EmptyPayload);
		}
		if self.closed.load(Ordering::SeqCst) {
			return Ok(());
		}
		{
			let mut st = self.state.lock().unwrap();
			st.outbound.push_back((data.to_vec(), to));
		}
		self.pool.set_write_interest(self.fd, true);
		Ok(())
	}

	pub fn close(&self) -> bool {
		self.close_with_reason(ClosedReason::ClosedByHost)
	}

	fn close_with_reason(&self, reason: ClosedReason) -> bool {
		if self.closed.swap(true, Ordering::SeqCst) {
			return false;
		}
		self.pool.remove(self.fd);
		if let Some(buffer) = &self.buffer {
			buffer.release();
		}
		debug!(fd = self.fd, ?reason, "udp endpoint closed");
		let mut hooks = self.hooks.lock().unwrap();
		if let Some(cb) = hooks.on_closed.as_mut() {
			cb(self, reason);
		}
		true
	}

	fn handle_readable(&self) {
		let Some(buffer) = &self.buffer else {
			// Send-only (unbound) endpoints never arm read interest; a
			// readable wake here would mean the pool invoked the wrong hook.
			return;
		};
		loop {
			let received = {
				let st = self.state.lock().unwrap();
				buffer.with_buffer(|buf| st.socket.recv_from(buf))
			};
			match received {
				Ok((n, from)) => {
					let bytes = buffer.with_buffer(|buf| buf[..n].to_vec());
					trace!(fd = self.fd, %from, len = n, "udp datagram received");
					let mut hooks = self.hooks.lock().unwrap();
					if let Some(cb) = hooks.on_recv.as_mut() {
						cb(self, &bytes, from);
					}
				},
				Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
				Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
				Err(_) => {
					// A single bad datagram (e.g. ICMP-reported unreachable
					// surfaced on the next recv) does not tear down the
					// endpoint; just stop draining for this wake.
					return;
				},
			}
		}
	}

	fn handle_writable(&self) {
		loop {
			let next = {
				let st = self.state.lock().unwrap();
				st.outbound.front().cloned()
			};
			let Some((data, to)) = next else {
				self.pool.set_write_interest(self.fd, false);
				let mut hooks = self.hooks.lock().unwrap();
				if let Some(cb) = hooks.on_can_send.as_mut() {
					cb(self);
				}
				return;
			};

			let sent = {
				let st = self.state.lock().unwrap();
				st.socket.send_to(&data, to)
			};
			match sent {
				Ok(_) => {
					let mut st = self.state.lock().unwrap();
					st.outbound.pop_front();
				},
				Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
				Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
				Err(_) => {
					{
						let mut st = self.state.lock().unwrap();
						st.outbound.pop_front();
					}
					let mut hooks = self.hooks.lock().unwrap();
					if let Some(cb) = hooks.on_fails_to_send.as_mut() {
						cb(self, &data, to);
					}
				},
			}
		}
	}
}

impl ReactorSocket for UdpEndpoint {
	fn raw_handle(&self) -> RawFd {
		self.fd
	}

	fn kind(&self) -> SocketKind {
		SocketKind::Udp
	}

	fn expire_deadline(&self) -> Option<Instant> {
		None
	}

	fn on_ready_for_reading(&self, _pool: &Arc<SocketsPool>) {
		self.handle_readable();
	}

	fn on_ready_for_writing(&self, _pool: &Arc<SocketsPool>) {
		self.handle_writable();
	}

	fn close(&self, reason: ClosedReason) -> bool {
		self.close_with_reason(reason)
	}
}
