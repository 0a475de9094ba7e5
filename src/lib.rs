//! Nonblocking TCP/UDP sockets reactor built on a single OS readiness
//! primitive (`poll(2)`), pooled receive buffers, and one-shot interest
//! arming. See [`SocketsPool`] for the entry point.

mod buffer;
mod error;
mod pool;
mod socket;
mod tcp_client;
mod tcp_server;
mod udp;

pub use buffer::{BufferSlot, BufferSlotPool, DEFAULT_SERVER_POOL_SLOTS, DEFAULT_SERVER_POOL_SLOT_SIZE, MIN_SLOT_SIZE};
pub use error::{ReactorError, Result};
pub use pool::{SocketsPool, CHECK_INTERVAL};
pub use socket::ClosedReason;
pub use tcp_client::{TcpClient, DEFAULT_CONNECT_TIMEOUT, DEFAULT_RECV_BUF_LEN};
pub use tcp_server::{TcpServer, DEFAULT_BACKLOG};
pub use udp::{UdpEndpoint, DEFAULT_DATAGRAM_BUF_LEN};

#[cfg(test)]
mod tests {
	use std::io::{Read, Write};
	use std::net::{SocketAddr, TcpStream};
	use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
	use std::sync::{Arc, Mutex};
	use std::time::Duration;

	use super::*;

	fn any_loopback() -> SocketAddr {
		"127.0.0.1:0".parse().unwrap()
	}

	fn spin_until(cond: impl Fn() -> bool, timeout: Duration) -> bool {
		let deadline = std::time::Instant::now() + timeout;
		while std::time::Instant::now() < deadline {
			if cond() {
				return true;
			}
			std::thread::sleep(Duration::from_millis(5));
		}
		cond()
	}

	#[test]
	fn echoes_a_line_back_to_the_client() {
		let pool = SocketsPool::new();
		let server = TcpServer::create_with_defaults(&pool, any_loopback()).unwrap();
		let addr = server.local_addr();

		server.on_client_accepted(|_server, client| {
			client.async_recv_line(None);
			client.on_line_recv(|client, line| {
				let mut reply = line.to_string();
				reply.push('\n');
				client.async_send_data(reply.as_bytes()).unwrap();
			});
		});

		pool.run(2);

		let mut stream = TcpStream::connect(addr).unwrap();
		stream.write_all(b"hello reactor\n").unwrap();

		let mut buf = [0u8; 64];
		stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
		let n = stream.read(&mut buf).unwrap();
		assert_eq!(&buf[..n], b"hello reactor\n");

		pool.stop();
	}

	#[test]
	fn recv_line_times_out_when_peer_sends_nothing() {
		let pool = SocketsPool::new();
		let server = TcpServer::create_with_defaults(&pool, any_loopback()).unwrap();
		let addr = server.local_addr();

		let timed_out = Arc::new(AtomicBool::new(false));
		let timed_out2 = Arc::clone(&timed_out);

		server.on_client_accepted(move |_server, client| {
			client.async_recv_line(Some(Duration::from_millis(100)));
			let timed_out = Arc::clone(&timed_out2);
			client.on_closed(move |_client, reason| {
				if reason == ClosedReason::Timeout {
					timed_out.store(true, Ordering::SeqCst);
				}
			});
		});

		pool.run(2);

		let _stream = TcpStream::connect(addr).unwrap();
		assert!(spin_until(|| timed_out.load(Ordering::SeqCst), Duration::from_secs(3)));

		pool.stop();
	}

	#[test]
	fn sized_read_waits_for_exactly_n_bytes() {
		let pool = SocketsPool::new();
		let server = TcpServer::create_with_defaults(&pool, any_loopback()).unwrap();
		let addr = server.local_addr();

		let received = Arc::new(Mutex::new(None));
		let received2 = Arc::clone(&received);

		server.on_client_accepted(move |_server, client| {
			client.async_recv_data(Some(5), None).unwrap();
			let received = Arc::clone(&received2);
			client.on_data_recv(move |_client, data| {
				*received.lock().unwrap() = Some(data.to_vec());
			});
		});

		pool.run(2);

		let mut stream = TcpStream::connect(addr).unwrap();
		stream.write_all(b"ab").unwrap();
		std::thread::sleep(Duration::from_millis(50));
		stream.write_all(b"cde").unwrap();

		assert!(spin_until(|| received.lock().unwrap().is_some(), Duration::from_secs(2)));
		assert_eq!(received.lock().unwrap().as_deref(), Some(&b"abcde"[..]));

		pool.stop();
	}

	#[test]
	fn opportunistic_read_delivers_whatever_arrived() {
		let pool = SocketsPool::new();
		let server = TcpServer::create_with_defaults(&pool, any_loopback()).unwrap();
		let addr = server.local_addr();

		let received = Arc::new(Mutex::new(None));
		let received2 = Arc::clone(&received);

		server.on_client_accepted(move |_server, client| {
			client.async_recv_data(None, None).unwrap();
			let received = Arc::clone(&received2);
			client.on_data_recv(move |_client, data| {
				*received.lock().unwrap() = Some(data.to_vec());
			});
		});

		pool.run(2);

		let mut stream = TcpStream::connect(addr).unwrap();
		stream.write_all(b"xy").unwrap();

		assert!(spin_until(|| received.lock().unwrap().is_some(), Duration::from_secs(2)));
		assert_eq!(received.lock().unwrap().as_deref(), Some(&b"xy"[..]));

		pool.stop();
	}

	#[test]
	fn udp_endpoint_drains_queued_datagrams_in_order() {
		let pool = SocketsPool::new();
		let endpoint = UdpEndpoint::bind(&pool, any_loopback(), false, 2048).unwrap();

		pool.run(2);

		let peer = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
		peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
		let peer_addr = peer.local_addr().unwrap();

		endpoint.async_send_datagram(b"one", peer_addr).unwrap();
		endpoint.async_send_datagram(b"two", peer_addr).unwrap();

		let mut buf = [0u8; 64];
		let (n, _) = peer.recv_from(&mut buf).unwrap();
		assert_eq!(&buf[..n], b"one");
		let (n, _) = peer.recv_from(&mut buf).unwrap();
		assert_eq!(&buf[..n], b"two");

		pool.stop();
	}

	#[test]
	fn unbound_udp_endpoint_is_send_only() {
		let pool = SocketsPool::new();
		let endpoint = UdpEndpoint::create(&pool, None, DEFAULT_DATAGRAM_BUF_LEN, false).unwrap();
		assert!(endpoint.local_addr().is_none());

		pool.run(2);

		let peer = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
		peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
		let peer_addr = peer.local_addr().unwrap();

		endpoint.async_send_datagram(b"hi", peer_addr).unwrap();

		let mut buf = [0u8; 64];
		let (n, _) = peer.recv_from(&mut buf).unwrap();
		assert_eq!(&buf[..n], b"hi");

		pool.stop();
	}

	#[test]
	fn buffer_pool_exhaustion_drops_connections_past_capacity() {
		let pool = SocketsPool::new();
		let server = TcpServer::create(&pool, any_loopback(), 16, 1, MIN_SLOT_SIZE).unwrap();
		let addr = server.local_addr();

		let accepted = Arc::new(AtomicUsize::new(0));
		let accepted2 = Arc::clone(&accepted);
		server.on_client_accepted(move |_server, _client| {
			accepted2.fetch_add(1, Ordering::SeqCst);
		});

		pool.run(2);

		let _s1 = TcpStream::connect(addr).unwrap();
		assert!(spin_until(|| accepted.load(Ordering::SeqCst) == 1, Duration::from_secs(2)));

		let _s2 = TcpStream::connect(addr).unwrap();
		std::thread::sleep(Duration::from_millis(200));
		assert_eq!(accepted.load(Ordering::SeqCst), 1);

		pool.stop();
	}

	#[test]
	fn buffer_slot_pool_rejects_undersized_slots() {
		let err = BufferSlotPool::new(4, 16, false).unwrap_err();
		assert!(matches!(err, ReactorError::InvalidBufferSize { .. }));
	}

	#[test]
	fn buffer_slot_lazily_rematerializes_after_release() {
		let pool = BufferSlotPool::new(1, MIN_SLOT_SIZE, false).unwrap();
		let slot = pool.acquire().unwrap();
		slot.with_buffer(|buf| buf[0] = 7);
		slot.release();

		let slot = pool.acquire().unwrap();
		let first_byte = slot.with_buffer(|buf| buf[0]);
		assert_eq!(first_byte, 0);
	}
}
