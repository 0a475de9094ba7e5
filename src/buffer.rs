use std::sync::{Arc, Mutex};

use crate::error::{ReactorError, Result};

/// Minimum buffer slot size accepted by any constructor in this crate.
pub const MIN_SLOT_SIZE: usize = 256;

/// Default server receive pool sizing (§6 of the design: 256 slots x 4096 bytes, lazy).
pub const DEFAULT_SERVER_POOL_SLOTS: usize = 256;
pub const DEFAULT_SERVER_POOL_SLOT_SIZE: usize = 4096;

struct Slot {
	available: bool,
	buffer: Option<Vec<u8>>,
}

/// A fixed pool of fixed-size byte regions, loaned to sockets first-fit.
///
/// Every slot is `size` bytes. When `keep_alloc` is false, a slot's backing
/// `Vec<u8>` is dropped as soon as it is released and lazily reallocated the
/// next time its bytes are touched — this keeps a large, sparsely used server
/// pool near a zero memory footprint at rest.
pub struct BufferSlotPool {
	size: usize,
	keep_alloc: bool,
	slots: Mutex<Vec<Slot>>,
}

impl BufferSlotPool {
	pub fn new(count: usize, size: usize, keep_alloc: bool) -> Result<Arc<Self>> {
		if size < MIN_SLOT_SIZE {
			return Err(ReactorError::InvalidBufferSize {
				got: size,
				min: MIN_SLOT_SIZE,
			});
		}
		let slots = (0..count)
			.map(|_| Slot {
				available: true,
				buffer: None,
			})
			.collect();
		Ok(Arc::new(Self {
			size,
			keep_alloc,
			slots: Mutex::new(slots),
		}))
	}

	pub fn slot_size(&self) -> usize {
		self.size
	}

	pub fn slots_count(&self) -> usize {
		self.slots.lock().unwrap().len()
	}

	/// Scans in order and returns the first available slot, flipping it
	/// unavailable under the pool's mutex. Returns `None` if none is free.
	pub fn acquire(self: &Arc<Self>) -> Option<BufferSlot> {
		let mut slots = self.slots.lock().unwrap();
		let index = slots.iter().position(|s| s.available)?;
		slots[index].available = false;
		Some(BufferSlot {
			pool: Arc::clone(self),
			index,
			size: self.size,
		})
	}
}

/// A single slot on loan from a [`BufferSlotPool`].
///
/// Holds exclusive use of its backing bytes until [`BufferSlot::release`] is
/// called by the owning socket's teardown path.
pub struct BufferSlot {
	pool: Arc<BufferSlotPool>,
	index: usize,
	size: usize,
}

impl BufferSlot {
	pub fn size(&self) -> usize {
		self.size
	}

	/// Runs `f` against the slot's backing bytes, materializing them on first
	/// touch if they were previously released with `keep_alloc = false`.
	pub fn with_buffer<R>(&self, f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
		let mut slots = self.pool.slots.lock().unwrap();
		let slot = &mut slots[self.index];
		let buf = slot.buffer.get_or_insert_with(|| vec![0u8; self.size]);
		f(buf)
	}

	/// Returns the slot to its pool. Idempotent from the caller's perspective
	/// in that calling it more than once simply re-marks it available.
	pub fn release(&self) {
		let mut slots = self.pool.slots.lock().unwrap();
		let slot = &mut slots[self.index];
		slot.available = true;
		if !self.pool.keep_alloc {
			slot.buffer = None;
		}
	}
}
