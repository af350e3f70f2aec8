use std::cell::UnsafeCell;

// Interior mutability without synchronization. Every value wrapped in this
// type is owned by exactly one thread at any point in its life: the wire and
// float buffers belong to the USB event thread, the outbound MIDI buffer to
// the MIDI thread. The thread handoff happens before the owning thread is
// spawned, never while it runs.
#[derive(Debug)]
pub struct UnsafeMutex<T> {
    data: UnsafeCell<T>,
}

impl<T> UnsafeMutex<T> {
    pub fn new(data: T) -> Self {
        UnsafeMutex {
            data: UnsafeCell::new(data),
        }
    }

    // "Locks" the value. No synchronization happens; the caller must be the
    // thread that owns the data at this point of the lifecycle.
    #[allow(clippy::mut_from_ref)]
    pub fn lock(&self) -> &mut T {
        // SAFETY: exclusive access is guaranteed by the single-owner-thread
        // protocol above, not by this type.
        unsafe { &mut *self.data.get() }
    }
}

unsafe impl<T: Send> Send for UnsafeMutex<T> {}
unsafe impl<T: Send> Sync for UnsafeMutex<T> {}
