//! Cache maintenance for DMA buffers
//!
//! With internal DMA enabled, the core reads and writes endpoint memory
//! behind the CPU's back. On a Cortex-M7 the D-cache must be cleaned before
//! the core reads a buffer, and invalidated before the CPU reads what the
//! core wrote.
//!
//! cortex-m only exposes these routines through an owned `SCB`. We neither
//! want to steal nor own that peripheral, so the needed routine is
//! duplicated here. See <https://github.com/rust-embedded/cortex-m/issues/304>.

/// Cleans and invalidates D-cache by address.
///
/// * `addr`: The address to clean and invalidate.
/// * `size`: The number of bytes to clean and invalidate.
///
/// Cleans and invalidates D-cache starting from the first cache line containing `addr`,
/// finishing once at least `size` bytes have been cleaned and invalidated.
///
/// Does nothing when the target has no Cortex-M cache controller.
#[cfg(all(target_arch = "arm", target_os = "none"))]
pub fn clean_invalidate_dcache_by_address(addr: usize, size: usize) {
    // No-op zero sized operations
    if size == 0 {
        return;
    }

    // Safety: write-only registers, pointer to static memory
    let cbp = unsafe { &*cortex_m::peripheral::CBP::PTR };

    cortex_m::asm::dsb();

    // Cache lines are fixed to 32 bytes on Cortex-M7 and not present in earlier Cortex-M
    const LINESIZE: usize = 32;
    let num_lines = ((size - 1) / LINESIZE) + 1;

    let mut addr = addr & 0xFFFF_FFE0;

    for _ in 0..num_lines {
        // Safety: write to Cortex-M write-only register
        unsafe { cbp.dccimvac.write(addr as u32) };
        addr += LINESIZE;
    }

    cortex_m::asm::dsb();
    cortex_m::asm::isb();
}

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
pub fn clean_invalidate_dcache_by_address(_addr: usize, _size: usize) {}
