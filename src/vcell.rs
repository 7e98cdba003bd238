//! Volatile register cell that satisfies the `ral-registers` macros
//!
//! The macros only need `read()` and `write()` on the named register
//! field, so one word-sized cell covers every OTG register.

use core::cell::UnsafeCell;

#[repr(transparent)]
pub struct VCell<T>(UnsafeCell<T>);

impl<T: Copy> VCell<T> {
    #[inline(always)]
    pub fn read(&self) -> T {
        // Safety: the cell is either MMIO, or test memory that
        // outlives every reference to it.
        unsafe { self.0.get().read_volatile() }
    }
    #[inline(always)]
    pub fn write(&self, val: T) {
        unsafe { self.0.get().write_volatile(val) }
    }
}
