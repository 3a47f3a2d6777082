//! Raw OS memory mapping, the bottom layer of the OS collaborator
//! (spec.md §6: "maps/unmaps/advises memory regions"). Everything above
//! this module only ever sees [`Slice`](crate::slice::Slice) handles; this
//! is the one place `mmap`/`VirtualAlloc` is called directly.

use crate::slice::Protection;

#[cfg(windows)]
mod _win {
    use super::*;
    use std::ptr::null_mut;
    use winapi::um::memoryapi::{VirtualAlloc, VirtualFree, VirtualProtect};
    use winapi::um::winnt::{
        MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READ,
        PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY, PAGE_NOACCESS, PAGE_READONLY,
        PAGE_READWRITE,
    };

    fn prot_flags(prot: Protection) -> u32 {
        match prot {
            Protection::None => PAGE_NOACCESS,
            Protection::R => PAGE_READONLY,
            Protection::W | Protection::RW => PAGE_READWRITE,
            Protection::X => PAGE_EXECUTE_READ,
            Protection::RX => PAGE_EXECUTE_READ,
            Protection::WX => PAGE_EXECUTE_WRITECOPY,
            Protection::RWX => PAGE_EXECUTE_READWRITE,
        }
    }

    pub fn map(size: usize, prot: Protection) -> Option<*mut u8> {
        unsafe {
            let mem = VirtualAlloc(null_mut(), size, MEM_RESERVE | MEM_COMMIT, prot_flags(prot));
            if mem.is_null() {
                None
            } else {
                Some(mem as *mut u8)
            }
        }
    }

    pub unsafe fn unmap(base: *mut u8, _size: usize) {
        VirtualFree(base.cast(), 0, MEM_RELEASE);
    }

    pub unsafe fn protect(base: *mut u8, size: usize, prot: Protection) {
        let mut old = 0;
        VirtualProtect(base.cast(), size, prot_flags(prot), &mut old);
    }

    pub unsafe fn advise_dontneed(base: *mut u8, size: usize) {
        VirtualFree(base.cast(), size, MEM_DECOMMIT);
    }

    pub unsafe fn advise_willneed(_base: *mut u8, _size: usize) {}
}

#[cfg(unix)]
mod _unix {
    use super::*;

    fn prot_flags(prot: Protection) -> libc::c_int {
        match prot {
            Protection::None => libc::PROT_NONE,
            Protection::R => libc::PROT_READ,
            Protection::W => libc::PROT_WRITE,
            Protection::RW => libc::PROT_READ | libc::PROT_WRITE,
            Protection::X => libc::PROT_EXEC,
            Protection::RX => libc::PROT_READ | libc::PROT_EXEC,
            Protection::WX => libc::PROT_WRITE | libc::PROT_EXEC,
            Protection::RWX => libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        }
    }

    pub fn map(size: usize, prot: Protection) -> Option<*mut u8> {
        unsafe {
            let addr = libc::mmap(
                core::ptr::null_mut(),
                size,
                prot_flags(prot),
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            );
            if addr == libc::MAP_FAILED {
                None
            } else {
                Some(addr as *mut u8)
            }
        }
    }

    pub unsafe fn unmap(base: *mut u8, size: usize) {
        libc::munmap(base as *mut _, size);
    }

    pub unsafe fn protect(base: *mut u8, size: usize, prot: Protection) {
        libc::mprotect(base as *mut _, size, prot_flags(prot));
    }

    pub unsafe fn advise_dontneed(base: *mut u8, size: usize) {
        libc::madvise(base as *mut _, size, libc::MADV_DONTNEED);
    }

    pub unsafe fn advise_willneed(base: *mut u8, size: usize) {
        libc::madvise(base as *mut _, size, libc::MADV_WILLNEED);
    }
}

#[cfg(unix)]
pub use _unix::*;
#[cfg(windows)]
pub use _win::*;
