use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use socket2::{Domain, Socket, Type};
use tracing::{debug, trace, warn};

use crate::buffer::BufferSlot;
use crate::error::{ReactorError, Result};
use crate::pool::SocketsPool;
use crate::socket::{ClosedReason, ReactorSocket, SocketKind};

/// Default outbound connect timeout (§6: 5.0s).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default receive buffer length for a dialed client (§6: 4096 bytes).
pub const DEFAULT_RECV_BUF_LEN: usize = 4096;

enum ReadMode {
	Idle,
	Line { pos: usize },
	Data { size_to_read: Option<usize>, filled: usize },
}

struct ClientState {
	stream: std::net::TcpStream,
	connected: bool,
	client_addr: Option<SocketAddr>,
	expire_deadline: Option<Instant>,
	read_mode: ReadMode,
	wr_buf: Vec<u8>,
	wr_pos: usize,
}

#[derive(Default)]
struct ClientHooks {
	on_connected: Option<Box<dyn FnMut(&TcpClient) + Send>>,
	on_fails_to_connect: Option<Box<dyn FnMut(&TcpClient) + Send>>,
	on_line_recv: Option<Box<dyn FnMut(&TcpClient, &str) + Send>>,
	on_data_recv: Option<Box<dyn FnMut(&TcpClient, &[u8]) + Send>>,
	on_can_send: Option<Box<dyn FnMut(&TcpClient) + Send>>,
	on_closed: Option<Box<dyn FnMut(&TcpClient, ClosedReason) + Send>>,
}

/// A nonblocking TCP stream connection: line reader, sized/opportunistic
/// data reader, queued writer, and (for dialed clients) connect completion.
pub struct TcpClient {
	pool: Arc<SocketsPool>,
	fd: RawFd,
	server_addr: SocketAddr,
	buffer: BufferSlot,
	state: Mutex<ClientState>,
	hooks: Mutex<ClientHooks>,
	closed: AtomicBool,
}

impl TcpClient {
	/// Dials `server_addr`. Issues a nonblocking connect; if it is still in
	/// progress (EINPROGRESS) or completed synchronously, arms write
	/// interest and the connect timeout, and returns the client. Otherwise
	/// the attempt is abandoned and no socket is created.
	pub fn connect(
		pool: &Arc<SocketsPool>,
		server_addr: SocketAddr,
		connect_timeout: Duration,
		recv_buf_len: usize,
	) -> Result<Arc<TcpClient>> {
		let size = recv_buf_len.max(crate::buffer::MIN_SLOT_SIZE);
		let domain = Domain::for_address(server_addr);
		let socket = Socket::new(domain, Type::STREAM, None)?;
		socket.set_nonblocking(true)?;

		match socket.connect(&server_addr.into()) {
			Ok(()) => {},
			Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {},
			Err(e) => return Err(e.into()),
		}

		let stream: std::net::TcpStream = socket.into();
		let fd = stream.as_raw_fd();
		let private_pool = crate::buffer::BufferSlotPool::new(1, size, true)?;
		let buffer = private_pool.acquire().expect("freshly created single-slot pool has a free slot");

		let client = Arc::new(TcpClient {
			pool: Arc::clone(pool),
			fd,
			server_addr,
			buffer,
			state: Mutex::new(ClientState {
				stream,
				connected: false,
				client_addr: None,
				expire_deadline: deadline_from(Some(connect_timeout)),
				read_mode: ReadMode::Idle,
				wr_buf: Vec::new(),
				wr_pos: 0,
			}),
			hooks: Mutex::new(ClientHooks::default()),
			closed: AtomicBool::new(false),
		});

		pool.add(client.clone() as Arc<dyn ReactorSocket>);
		pool.set_write_interest(fd, true);
		Ok(client)
	}

	/// Wraps an already-accepted stream (used by [`crate::tcp_server::TcpServer`]).
	pub(crate) fn from_accepted(
		pool: Arc<SocketsPool>,
		stream: std::net::TcpStream,
		server_addr: SocketAddr,
		client_addr: SocketAddr,
		buffer: BufferSlot,
	) -> io::Result<Arc<TcpClient>> {
		stream.set_nonblocking(true)?;
		let fd = stream.as_raw_fd();
		let client = Arc::new(TcpClient {
			pool: Arc::clone(&pool),
			fd,
			server_addr,
			buffer,
			state: Mutex::new(ClientState {
				stream,
				connected: true,
				client_addr: Some(client_addr),
				expire_deadline: None,
				read_mode: ReadMode::Idle,
				wr_buf: Vec::new(),
				wr_pos: 0,
			}),
			hooks: Mutex::new(ClientHooks::default()),
			closed: AtomicBool::new(false),
		});
		pool.add(client.clone() as Arc<dyn ReactorSocket>);
		Ok(client)
	}

	pub fn raw_handle(&self) -> RawFd {
		self.fd
	}

	pub fn server_addr(&self) -> SocketAddr {
		self.server_addr
	}

	pub fn client_addr(&self) -> Option<SocketAddr> {
		self.state.lock().unwrap().client_addr
	}

	pub fn is_connected(&self) -> bool {
		self.state.lock().unwrap().connected
	}

	pub fn on_connected(&self, f: impl FnMut(&TcpClient) + Send + 'static) {
		self.hooks.lock().unwrap().on_connected = Some(Box::new(f));
	}

	pub fn on_fails_to_connect(&self, f: impl FnMut(&TcpClient) + Send + 'static) {
		self.hooks.lock().unwrap().on_fails_to_connect = Some(Box::new(f));
	}

	pub fn on_line_recv(&self, f: impl FnMut(&TcpClient, &str) + Send + 'static) {
		self.hooks.lock().unwrap().on_line_recv = Some(Box::new(f));
	}

	pub fn on_data_recv(&self, f: impl FnMut(&TcpClient, &[u8]) + Send + 'static) {
		self.hooks.lock().unwrap().on_data_recv = Some(Box::new(f));
	}

	pub fn on_can_send(&self, f: impl FnMut(&TcpClient) + Send + 'static) {
		self.hooks.lock().unwrap().on_can_send = Some(Box::new(f));
	}

	pub fn on_closed(&self, f: impl FnMut(&TcpClient, ClosedReason) + Send + 'static) {
		self.hooks.lock().unwrap().on_closed = Some(Box::new(f));
	}

	/// Arms line mode: reads one byte at a time until `\n`, stripping `\r`.
	pub fn async_recv_line(&self, timeout: Option<Duration>) {
		{
			let mut st = self.state.lock().unwrap();
			st.read_mode = ReadMode::Line { pos: 0 };
			st.expire_deadline = deadline_from(timeout);
		}
		self.pool.set_read_interest(self.fd, true);
	}

	/// Arms data mode. `size = None` (or `Some(0)`) is opportunistic: read
	/// whatever is available up to buffer capacity. `Some(n)` requires
	/// exactly `n` bytes, `n` must not exceed the buffer slot's size.
	pub fn async_recv_data(&self, size: Option<usize>, timeout: Option<Duration>) -> Result<()> {
		let capacity = self.buffer.size();
		let size_to_read = match size {
			None | Some(0) => None,
			Some(n) if n > capacity => {
				return Err(ReactorError::ReadSizeExceedsBuffer {
					requested: n,
					capacity,
				});
			},
			Some(n) => Some(n),
		};
		{
			let mut st = self.state.lock().unwrap();
			st.read_mode = ReadMode::Data {
				size_to_read,
				filled: 0,
			};
			st.expire_deadline = deadline_from(timeout);
		}
		self.pool.set_read_interest(self.fd, true);
		Ok(())
	}

	/// Appends `data` to the outbound queue and arms write interest. Returns
	/// an error for an empty payload; does nothing (and returns `Ok(())`
	/// without arming) if the socket is already closed.
	pub fn async_send_data(&self, data: &[u8]) -> Result<()> {
		if data.is_empty() {
			return Err(ReactorError::EmptyPayload);
		}
		if self.closed.load(Ordering::SeqCst) {
			return Ok(());
		}
		{
			let mut st = self.state.lock().unwrap();
			st.wr_buf.extend_from_slice(data);
		}
		self.pool.set_write_interest(self.fd, true);
		Ok(())
	}

	/// `shutdown(RDWR)` best-effort, then standard teardown with
	/// `ClosedByHost`.
	pub fn close(&self) -> bool {
		if let Ok(st) = self.state.lock() {
			let _ = st.stream.shutdown(std::net::Shutdown::Both);
		}
		self.close_with_reason(ClosedReason::ClosedByHost, true)
	}

	fn close_with_reason(&self, reason: ClosedReason, trigger_on_closed: bool) -> bool {
		if self.closed.swap(true, Ordering::SeqCst) {
			return false;
		}
		self.pool.remove(self.fd);
		self.buffer.release();
		debug!(fd = self.fd, ?reason, "tcp client closed");
		if trigger_on_closed {
			let mut hooks = self.hooks.lock().unwrap();
			if let Some(cb) = hooks.on_closed.as_mut() {
				cb(self, reason);
			}
		}
		true
	}

	fn complete_connect(&self) {
		let err = {
			let st = self.state.lock().unwrap();
			st.stream.take_error()
		};
		match err {
			Ok(None) => {},
			Ok(Some(_)) | Err(_) => {
				self.closed.store(true, Ordering::SeqCst);
				self.pool.remove(self.fd);
				self.buffer.release();
				warn!(fd = self.fd, "tcp client failed to connect");
				let mut hooks = self.hooks.lock().unwrap();
				if let Some(cb) = hooks.on_fails_to_connect.as_mut() {
					cb(self);
				}
				return;
			},
		}

		{
			let mut st = self.state.lock().unwrap();
			st.connected = true;
			st.client_addr = st.stream.local_addr().ok();
			st.expire_deadline = None;
		}
		debug!(fd = self.fd, "tcp client connected");
		{
			let mut hooks = self.hooks.lock().unwrap();
			if let Some(cb) = hooks.on_connected.as_mut() {
				cb(self);
			}
		}
		self.handle_writable();
	}

	fn handle_writable(&self) {
		loop {
			let chunk = {
				let st = self.state.lock().unwrap();
				if st.wr_pos >= st.wr_buf.len() {
					None
				} else {
					Some(st.wr_buf[st.wr_pos..].to_vec())
				}
			};
			let Some(chunk) = chunk else {
				self.pool.set_write_interest(self.fd, false);
				let mut hooks = self.hooks.lock().unwrap();
				if let Some(cb) = hooks.on_can_send.as_mut() {
					cb(self);
				}
				return;
			};

			let n = {
				let st = self.state.lock().unwrap();
				(&st.stream).write(&chunk)
			};
			match n {
				Ok(0) => return,
				Ok(n) => {
					let mut st = self.state.lock().unwrap();
					st.wr_pos += n;
					if st.wr_pos >= st.wr_buf.len() {
						st.wr_buf.clear();
						st.wr_pos = 0;
					}
				},
				Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
				Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
				Err(_) => {
					self.close_with_reason(ClosedReason::Error, true);
					return;
				},
			}
		}
	}

	fn handle_readable(&self) {
		let is_line = matches!(self.state.lock().unwrap().read_mode, ReadMode::Line { .. });
		if is_line {
			self.handle_line_readable();
		} else {
			self.handle_data_readable();
		}
	}

	fn handle_line_readable(&self) {
		loop {
			let mut byte = [0u8; 1];
			let n = {
				let st = self.state.lock().unwrap();
				(&st.stream).read(&mut byte)
			};
			match n {
				Ok(0) => {
					self.close_with_reason(ClosedReason::ClosedByPeer, true);
					return;
				},
				Ok(_) => match byte[0] {
					b'\n' => {
						let pos = {
							let mut st = self.state.lock().unwrap();
							let pos = match st.read_mode {
								ReadMode::Line { pos } => pos,
								_ => return,
							};
							st.read_mode = ReadMode::Idle;
							st.expire_deadline = None;
							pos
						};
						self.pool.set_read_interest(self.fd, false);
						let line_bytes = self.buffer.with_buffer(|buf| buf[..pos].to_vec());
						if let Ok(line) = std::str::from_utf8(&line_bytes) {
							let mut hooks = self.hooks.lock().unwrap();
							if let Some(cb) = hooks.on_line_recv.as_mut() {
								cb(self, line);
							}
						}
						// decode failure silently aborts the callback, no close.
						return;
					},
					b'\r' => continue,
					b => {
						let overflowed = {
							let mut st = self.state.lock().unwrap();
							let pos = match &mut st.read_mode {
								ReadMode::Line { pos } => pos,
								_ => return,
							};
							if *pos >= self.buffer.size() {
								true
							} else {
								let at = *pos;
								*pos += 1;
								self.buffer.with_buffer(|buf| buf[at] = b);
								false
							}
						};
						if overflowed {
							self.close_with_reason(ClosedReason::Error, true);
							return;
						}
						continue;
					},
				},
				Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
				Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
				Err(_) => {
					// Read error while some bytes were readable this wake:
					// wait for the next readable event instead of closing.
					return;
				},
			}
		}
	}

	fn handle_data_readable(&self) {
		let (offset, want) = {
			let st = self.state.lock().unwrap();
			match st.read_mode {
				ReadMode::Data { size_to_read, filled } => {
					let want = size_to_read.unwrap_or(self.buffer.size()) - filled;
					(filled, want)
				},
				_ => return,
			}
		};
		if want == 0 {
			return;
		}

		let n = {
			let st = self.state.lock().unwrap();
			self.buffer.with_buffer(|buf| (&st.stream).read(&mut buf[offset..offset + want]))
		};
		match n {
			Ok(0) => {
				self.close_with_reason(ClosedReason::ClosedByPeer, true);
			},
			Ok(n) => {
				let (done, total) = {
					let mut st = self.state.lock().unwrap();
					match &mut st.read_mode {
						ReadMode::Data { size_to_read, filled } => {
							*filled += n;
							let total = *filled;
							let done = match size_to_read {
								Some(sz) => total >= *sz,
								None => true,
							};
							(done, total)
						},
						_ => (false, 0),
					}
				};
				if done {
					{
						let mut st = self.state.lock().unwrap();
						st.read_mode = ReadMode::Idle;
						st.expire_deadline = None;
					}
					self.pool.set_read_interest(self.fd, false);
					let view = self.buffer.with_buffer(|buf| buf[..total].to_vec());
					let mut hooks = self.hooks.lock().unwrap();
					if let Some(cb) = hooks.on_data_recv.as_mut() {
						cb(self, &view);
					}
				}
				// Otherwise (sized mode, partial read): stay armed.
			},
			Err(e) if e.kind() == io::ErrorKind::WouldBlock => {},
			Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
			Err(_) => {
				self.close_with_reason(ClosedReason::Error, true);
			},
		}
	}
}

fn deadline_from(timeout: Option<Duration>) -> Option<Instant> {
	match timeout {
		Some(d) if !d.is_zero() => Some(Instant::now() + d),
		_ => None,
	}
}

impl ReactorSocket for TcpClient {
	fn raw_handle(&self) -> RawFd {
		self.fd
	}

	fn kind(&self) -> SocketKind {
		SocketKind::TcpClient
	}

	fn expire_deadline(&self) -> Option<Instant> {
		self.state.lock().unwrap().expire_deadline
	}

	fn on_ready_for_reading(&self, _pool: &Arc<SocketsPool>) {
		trace!(fd = self.fd, "tcp client readable");
		self.handle_readable();
	}

	fn on_ready_for_writing(&self, _pool: &Arc<SocketsPool>) {
		trace!(fd = self.fd, "tcp client writable");
		let connected = self.state.lock().unwrap().connected;
		if !connected {
			self.complete_connect();
			return;
		}
		self.handle_writable();
	}

	fn close(&self, reason: ClosedReason) -> bool {
		self.close_with_reason(reason, true)
	}
}
