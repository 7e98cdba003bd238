//! Endpoint and channel memory buffers

use core::{
    cell::UnsafeCell,
    ptr::NonNull,
    sync::atomic::{AtomicBool, Ordering},
};

/// Memory for endpoint or channel transfer buffers
///
/// Allocate one `static` `EndpointMemory` per driver, and hand it to the
/// device or host constructor. The driver partitions it for the buffers
/// that it needs.
///
/// ```
/// use dwc_otg::EndpointMemory;
///
/// static EP_MEMORY: EndpointMemory<2048> = EndpointMemory::new();
/// ```
#[repr(align(32))]
pub struct EndpointMemory<const SIZE: usize> {
    buffer: UnsafeCell<[u8; SIZE]>,
    taken: AtomicBool,
}

// Safety: the buffer is only reachable through the single allocator
// that `allocator()` ever hands out.
unsafe impl<const SIZE: usize> Sync for EndpointMemory<SIZE> {}

impl<const SIZE: usize> EndpointMemory<SIZE> {
    pub const fn new() -> Self {
        EndpointMemory {
            buffer: UnsafeCell::new([0; SIZE]),
            taken: AtomicBool::new(false),
        }
    }

    /// Acquire the allocator for this memory
    ///
    /// Returns `None` if the allocator was already taken.
    pub(crate) fn allocator(&'static self) -> Option<Allocator> {
        if self.taken.swap(true, Ordering::SeqCst) {
            return None;
        }
        let start = NonNull::new(self.buffer.get().cast::<u8>())?;
        // Safety: the allocator is the sole owner of this static memory.
        Some(unsafe { Allocator::new(start, SIZE) })
    }
}

impl<const SIZE: usize> Default for EndpointMemory<SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

/// Endpoint memory buffer allocator
///
/// Buffers are handed out top-down. A [`Watermark`] taken from
/// [`watermark()`](Allocator::watermark) lets the caller release every
/// buffer allocated after that point.
pub struct Allocator {
    start: *mut u8,
    ptr: *mut u8,
}

/// A point in the allocation history, see [`Allocator::release_to`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Watermark(usize);

impl Allocator {
    /// # Safety
    ///
    /// Caller must ensure `start` points to an allocation of size. Caller must
    /// ensure that no one else is using this memory for anything else.
    pub unsafe fn new(start: NonNull<u8>, size: usize) -> Self {
        let start = start.as_ptr();
        let ptr = start.add(size);
        Allocator { start, ptr }
    }

    /// Allocates a buffer of `size` bytes, aligned to a word
    pub fn allocate(&mut self, size: usize) -> Option<Buffer> {
        let ptr = self.ptr as usize;
        let new_ptr = ptr.checked_sub(size)? & !0b11;
        let start = self.start as usize;
        if new_ptr < start {
            None
        } else {
            self.ptr = new_ptr as *mut u8;
            NonNull::new(self.ptr).map(|ptr| Buffer { ptr, len: size })
        }
    }

    /// Remember the current allocation point
    pub fn watermark(&self) -> Watermark {
        Watermark(self.ptr as usize)
    }

    /// Release every buffer allocated after `mark` was taken
    ///
    /// The caller must not touch those buffers again.
    pub fn release_to(&mut self, mark: Watermark) {
        if mark.0 > self.ptr as usize {
            self.ptr = mark.0 as *mut u8;
        }
    }
}

/// A region of endpoint memory
///
/// Access goes through volatile reads and writes, since the buffer may be
/// a DMA target.
pub struct Buffer {
    ptr: NonNull<u8>,
    len: usize,
}

unsafe impl Send for Buffer {}

impl Buffer {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Copy `buffer.len()` bytes starting at `offset` into `buffer`
    ///
    /// Returns how many bytes were copied; that's short when the region ends first.
    pub fn volatile_read(&self, offset: usize, buffer: &mut [u8]) -> usize {
        let size = buffer.len().min(self.len.saturating_sub(offset));
        buffer[..size].iter_mut().enumerate().for_each(|(idx, dst)| {
            // Safety: idx + offset is within the region.
            *dst = unsafe { self.ptr.as_ptr().add(offset + idx).read_volatile() };
        });
        size
    }

    /// Copy `buffer` into the region starting at `offset`
    ///
    /// Returns how many bytes were copied.
    pub fn volatile_write(&mut self, offset: usize, buffer: &[u8]) -> usize {
        let size = buffer.len().min(self.len.saturating_sub(offset));
        buffer[..size].iter().enumerate().for_each(|(idx, src)| {
            unsafe { self.ptr.as_ptr().add(offset + idx).write_volatile(*src) };
        });
        size
    }

    /// Clean and invalidate the first `size` bytes from the data cache
    pub fn clean_invalidate_dcache(&self, size: usize) {
        crate::cache::clean_invalidate_dcache_by_address(
            self.ptr.as_ptr() as usize,
            size.min(self.len),
        );
    }
}

#[cfg(test)]
mod test {
    use super::Allocator;
    use core::ptr::NonNull;

    #[test]
    fn allocate_entire_buffer() {
        let mut buffer = [0u32; 8];
        let base = buffer.as_mut_ptr().cast::<u8>();
        let mut alloc = unsafe { Allocator::new(NonNull::new_unchecked(base), 32) };
        let ptr = alloc.allocate(32);
        assert!(ptr.is_some());
        assert_eq!(ptr.unwrap().as_ptr(), base as *const u8);

        let ptr = alloc.allocate(1);
        assert!(ptr.is_none());
    }

    #[test]
    fn allocations_are_word_aligned() {
        let mut buffer = [0u32; 8];
        let base = buffer.as_mut_ptr().cast::<u8>();
        let mut alloc = unsafe { Allocator::new(NonNull::new_unchecked(base), 32) };

        let first = alloc.allocate(7).unwrap();
        assert_eq!(first.as_ptr(), unsafe { base.add(24) } as *const u8);
        assert_eq!(first.len(), 7);

        let second = alloc.allocate(7).unwrap();
        assert_eq!(second.as_ptr(), unsafe { base.add(16) } as *const u8);

        assert!(alloc.allocate(19).is_none());
    }

    #[test]
    fn release_to_watermark() {
        let mut buffer = [0u32; 8];
        let base = buffer.as_mut_ptr().cast::<u8>();
        let mut alloc = unsafe { Allocator::new(NonNull::new_unchecked(base), 32) };

        alloc.allocate(8).unwrap();
        let mark = alloc.watermark();
        alloc.allocate(24).unwrap();
        assert!(alloc.allocate(4).is_none());

        alloc.release_to(mark);
        let again = alloc.allocate(24).unwrap();
        assert_eq!(again.as_ptr(), base as *const u8);
    }

    #[test]
    fn volatile_copies_stop_at_region_end() {
        let mut buffer = [0u32; 4];
        let base = buffer.as_mut_ptr().cast::<u8>();
        let mut alloc = unsafe { Allocator::new(NonNull::new_unchecked(base), 16) };
        let mut buf = alloc.allocate(8).unwrap();

        assert_eq!(buf.volatile_write(4, &[1, 2, 3, 4, 5, 6]), 4);
        let mut out = [0; 6];
        assert_eq!(buf.volatile_read(2, &mut out), 6);
        assert_eq!(out, [0, 0, 1, 2, 3, 4]);
    }
}
