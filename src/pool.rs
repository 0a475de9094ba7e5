use std::collections::{HashMap, HashSet};
use std::os::fd::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error};

use crate::socket::{ClosedReason, ReactorSocket};

/// How often the readiness wait times out and the registry is swept for
/// expired deadlines.
pub const CHECK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
enum DispatchKind {
	Exceptional,
	Writable,
	Readable,
}

struct PoolState {
	registry: HashMap<RawFd, Arc<dyn ReactorSocket>>,
	read_interest: HashSet<RawFd>,
	write_interest: HashSet<RawFd>,
	handling: HashSet<RawFd>,
}

/// Registry of live sockets, their interest sets, and the readiness loop
/// that dispatches to them.
///
/// A single [`Mutex`] guards the registry and interest sets; the loop's
/// wait step (`poll(2)`, one `poll` call per worker per wake) happens
/// outside the lock, so registration traffic never blocks on I/O.
pub struct SocketsPool {
	state: Mutex<PoolState>,
	processing: AtomicBool,
	threads_active: AtomicUsize,
	next_sweep: Mutex<Instant>,
}

impl SocketsPool {
	pub fn new() -> Arc<Self> {
		Arc::new(Self {
			state: Mutex::new(PoolState {
				registry: HashMap::new(),
				read_interest: HashSet::new(),
				write_interest: HashSet::new(),
				handling: HashSet::new(),
			}),
			processing: AtomicBool::new(false),
			threads_active: AtomicUsize::new(0),
			next_sweep: Mutex::new(Instant::now() + CHECK_INTERVAL),
		})
	}

	/// Registers a socket. Returns `false` if its handle is already present.
	pub(crate) fn add(&self, sock: Arc<dyn ReactorSocket>) -> bool {
		let fd = sock.raw_handle();
		let mut st = self.state.lock().unwrap();
		if st.registry.contains_key(&fd) {
			return false;
		}
		debug!(fd, kind = ?sock.kind(), "registering socket");
		st.registry.insert(fd, sock);
		true
	}

	/// Deregisters a socket and drops it from every interest set. Returns
	/// `false` if the handle was not present.
	pub(crate) fn remove(&self, handle: RawFd) -> bool {
		let mut st = self.state.lock().unwrap();
		if st.registry.remove(&handle).is_none() {
			return false;
		}
		st.read_interest.remove(&handle);
		st.write_interest.remove(&handle);
		st.handling.remove(&handle);
		debug!(fd = handle, "deregistered socket");
		true
	}

	pub(crate) fn set_read_interest(&self, handle: RawFd, on: bool) -> bool {
		let mut st = self.state.lock().unwrap();
		if !st.registry.contains_key(&handle) {
			return false;
		}
		if on {
			st.read_interest.insert(handle)
		} else {
			st.read_interest.remove(&handle)
		}
	}

	pub(crate) fn set_write_interest(&self, handle: RawFd, on: bool) -> bool {
		let mut st = self.state.lock().unwrap();
		if !st.registry.contains_key(&handle) {
			return false;
		}
		if on {
			st.write_interest.insert(handle)
		} else {
			st.write_interest.remove(&handle)
		}
	}

	/// Spawns `thread_count` worker threads running the readiness loop, or
	/// (if zero) runs the loop inline on the calling thread until `stop` is
	/// called from elsewhere.
	pub fn run(self: &Arc<Self>, thread_count: usize) {
		self.processing.store(true, Ordering::SeqCst);
		if thread_count == 0 {
			Arc::clone(self).worker_loop();
			return;
		}
		for id in 0..thread_count {
			let this = Arc::clone(self);
			thread::Builder::new()
				.name(format!("netreactor-{id}"))
				.spawn(move || this.worker_loop())
				.expect("failed to spawn reactor worker thread");
		}
	}

	/// Clears the processing flag and spin-waits until every worker has
	/// exited. No in-flight hook is interrupted.
	pub fn stop(&self) {
		self.processing.store(false, Ordering::SeqCst);
		while self.threads_active.load(Ordering::SeqCst) > 0 {
			thread::sleep(Duration::from_millis(1));
		}
	}

	fn worker_loop(self: Arc<Self>) {
		self.threads_active.fetch_add(1, Ordering::SeqCst);
		while self.processing.load(Ordering::SeqCst) {
			let (reads, writes) = {
				let st = self.state.lock().unwrap();
				(st.read_interest.clone(), st.write_interest.clone())
			};

			let fds: Vec<RawFd> = reads.iter().chain(writes.iter()).copied().collect::<HashSet<_>>().into_iter().collect();
			let mut pollfds: Vec<libc::pollfd> = fds
				.iter()
				.map(|&fd| {
					let mut events: libc::c_short = 0;
					if reads.contains(&fd) {
						events |= libc::POLLIN;
					}
					if writes.contains(&fd) {
						events |= libc::POLLOUT;
					}
					libc::pollfd {
						fd,
						events,
						revents: 0,
					}
				})
				.collect();

			let ret = unsafe {
				libc::poll(
					pollfds.as_mut_ptr(),
					pollfds.len() as libc::nfds_t,
					CHECK_INTERVAL.as_millis() as libc::c_int,
				)
			};

			if ret < 0 {
				// Transient failure of the waiter is tolerated; the loop is
				// self-healing.
				continue;
			}

			if !self.processing.load(Ordering::SeqCst) {
				break;
			}

			let mut exceptional = Vec::new();
			let mut writable = Vec::new();
			let mut readable = Vec::new();
			for pfd in &pollfds {
				if pfd.revents == 0 {
					continue;
				}
				if pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
					exceptional.push(pfd.fd);
				}
				if pfd.revents & libc::POLLOUT != 0 {
					writable.push(pfd.fd);
				}
				if pfd.revents & libc::POLLIN != 0 {
					readable.push(pfd.fd);
				}
			}

			for fd in exceptional {
				self.dispatch(fd, DispatchKind::Exceptional);
			}
			for fd in writable {
				self.dispatch(fd, DispatchKind::Writable);
			}
			for fd in readable {
				self.dispatch(fd, DispatchKind::Readable);
			}

			self.sweep_if_due();
		}
		self.threads_active.fetch_sub(1, Ordering::SeqCst);
	}

	fn dispatch(self: &Arc<Self>, fd: RawFd, kind: DispatchKind) {
		let sock = {
			let mut st = self.state.lock().unwrap();
			if !st.registry.contains_key(&fd) {
				return;
			}
			if !st.handling.insert(fd) {
				// Another worker already claimed this wake for this fd.
				return;
			}
			st.registry.get(&fd).cloned()
		};
		let Some(sock) = sock else { return };

		let _span = trace_span(fd, kind);
		let result = panic::catch_unwind(AssertUnwindSafe(|| match kind {
			DispatchKind::Exceptional => sock.on_exceptional_condition(self),
			DispatchKind::Writable => sock.on_ready_for_writing(self),
			DispatchKind::Readable => sock.on_ready_for_reading(self),
		}));
		if result.is_err() {
			error!(fd, ?kind, "socket hook panicked; dropping this dispatch and continuing");
		}

		let mut st = self.state.lock().unwrap();
		st.handling.remove(&fd);
	}

	fn sweep_if_due(&self) {
		let now = Instant::now();
		let due = {
			let mut next = self.next_sweep.lock().unwrap();
			if now >= *next {
				*next = now + CHECK_INTERVAL;
				true
			} else {
				false
			}
		};
		if !due {
			return;
		}

		let expired: Vec<Arc<dyn ReactorSocket>> = {
			let st = self.state.lock().unwrap();
			st.registry
				.values()
				.filter(|s| s.expire_deadline().is_some_and(|d| now >= d))
				.cloned()
				.collect()
		};
		for sock in expired {
			debug!(fd = sock.raw_handle(), "closing socket: expire timeout reached");
			sock.close(ClosedReason::Timeout);
		}
	}
}

fn trace_span(fd: RawFd, kind: DispatchKind) -> tracing::span::EnteredSpan {
	tracing::trace_span!("dispatch", fd, ?kind).entered()
}
