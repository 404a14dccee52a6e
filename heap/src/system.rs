use std::ptr::NonNull;

use bitflags::bitflags;

#[cfg(unix)]
#[allow(unused)]
mod unix {
    use core::ffi::c_void;

    pub const PROT_NONE: i32 = 0x0;
    pub const PROT_READ: i32 = 0x1;
    pub const PROT_WRITE: i32 = 0x2;
    pub const PROT_EXEC: i32 = 0x4;

    pub const MAP_PRIVATE: i32 = 0x02;

    #[cfg(target_os = "linux")]
    pub const MAP_ANON: i32 = 0x20;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    pub const MAP_ANON: i32 = 0x1000;

    pub const MAP_FAILED: isize = -1;

    /// posix mmap, munmap and mprotect
    /// # Safety
    /// see valid mmap and munmap usage online
    unsafe extern "C" {
        pub fn mmap(
            addr: *mut c_void,
            length: usize,
            prot: i32,
            flags: i32,
            fd: i32,
            offset: isize,
        ) -> *mut c_void;

        pub fn munmap(addr: *mut c_void, length: usize) -> i32;

        pub fn mprotect(addr: *mut c_void, length: usize, prot: i32) -> i32;
    }

    /// # Safety
    /// null must be checked
    #[inline]
    pub unsafe fn anonymous_mmap(len: usize) -> *mut u8 {
        // SAFETY: safe if contract holds
        let p = unsafe {
            mmap(
                core::ptr::null_mut(),
                len,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANON,
                -1,
                0,
            )
        };
        if (p as isize) == MAP_FAILED {
            core::ptr::null_mut()
        } else {
            p as *mut u8
        }
    }

    /// # Safety
    /// must be allocated by mmap
    #[inline]
    pub unsafe fn anonymous_munmap(ptr: *mut u8, len: usize) {
        // SAFETY: safe if contract holds
        let _ = unsafe { munmap(ptr.cast(), len) };
    }
}

pub const OS_PAGE_SIZE: usize = 4096;

bitflags! {
    /// Access rights of a mapped region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: i32 {
        const READ = unix::PROT_READ;
        const WRITE = unix::PROT_WRITE;
        const EXECUTE = unix::PROT_EXEC;
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        const READ_EXECUTE = Self::READ.bits() | Self::EXECUTE.bits();
    }
}

#[must_use]
pub fn map_memory(size: usize) -> Option<NonNull<u8>> {
    // SAFETY: this is safe
    let ptr = unsafe { unix::anonymous_mmap(size) };
    NonNull::new(ptr)
}

pub fn unmap_memory(ptr: NonNull<u8>, size: usize) {
    // SAFETY: ptr must be from mmap allocation
    unsafe { unix::anonymous_munmap(ptr.as_ptr(), size) };
}

/// Maps `size` bytes starting at a multiple of `alignment`.
///
/// Over-maps by `alignment` and returns the unused head and tail to the OS,
/// so the result can later be released with [`unmap_memory`].
#[must_use]
pub fn map_aligned(size: usize, alignment: usize) -> Option<NonNull<u8>> {
    debug_assert!(alignment.is_power_of_two());
    debug_assert!(size % OS_PAGE_SIZE == 0);
    if alignment <= OS_PAGE_SIZE {
        return map_memory(size);
    }
    let total = size + alignment;
    let raw = map_memory(total)?;
    let start = raw.as_ptr() as usize;
    let aligned = (start + alignment - 1) & !(alignment - 1);
    let head = aligned - start;
    let tail = total - head - size;
    if head > 0 {
        unmap_memory(raw, head);
    }
    if tail > 0 {
        // SAFETY: `aligned + size` lies inside the mapping
        let tail_ptr = unsafe { NonNull::new_unchecked((aligned + size) as *mut u8) };
        unmap_memory(tail_ptr, tail);
    }
    NonNull::new(aligned as *mut u8)
}

/// Changes the access rights of a mapped range. Returns `false` on failure.
pub fn protect_memory(ptr: NonNull<u8>, size: usize, protection: Protection) -> bool {
    // SAFETY: ptr and size must describe (part of) a live mapping
    let rc = unsafe { unix::mprotect(ptr.as_ptr().cast(), size, protection.bits()) };
    rc == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_mapping_respects_alignment() {
        let alignment = 256 * 1024;
        let ptr = map_aligned(alignment, alignment).expect("mmap");
        assert_eq!(ptr.as_ptr() as usize % alignment, 0);
        unsafe { ptr.as_ptr().write(7) };
        unmap_memory(ptr, alignment);
    }

    #[test]
    fn protect_round_trip() {
        let ptr = map_memory(OS_PAGE_SIZE).expect("mmap");
        assert!(protect_memory(ptr, OS_PAGE_SIZE, Protection::READ));
        assert!(protect_memory(ptr, OS_PAGE_SIZE, Protection::READ_WRITE));
        unsafe { ptr.as_ptr().write(1) };
        unmap_memory(ptr, OS_PAGE_SIZE);
    }
}
