//! The Unix heap grower: the arena lives on the program break, and large
//! blocks get anonymous private mappings.

use core::fmt;
use core::ptr::{null_mut, NonNull};

use errno::Errno;
use log::trace;
use spin::Mutex;

use crate::allocators::HeapGrower;
use crate::round_up;

// The break is process-wide; growers in one process take turns moving it.
static BREAK: Mutex<()> = Mutex::new(());

/// A failed system call, and the errno it left behind.
#[derive(Clone, Copy, Debug)]
pub struct OsError {
    pub call: &'static str,
    pub errno: Errno,
}

impl OsError {
    fn last(call: &'static str) -> Self {
        OsError {
            call,
            errno: errno::errno(),
        }
    }
}

impl fmt::Display for OsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}() failed: {}", self.call, self.errno)
    }
}

/// UnixHeapGrower moves the program break to grow the heap upon request.
///
/// The break is shared with anything else in the process that calls `sbrk`,
/// so consecutive growths are not guaranteed to be contiguous.
#[derive(Default)]
pub struct UnixHeapGrower {
    // Just for tracking, not really needed
    pages: usize,
    growths: usize,
    mappings: usize,
}

impl UnixHeapGrower {
    pub const fn new() -> Self {
        UnixHeapGrower {
            pages: 0,
            growths: 0,
            mappings: 0,
        }
    }

    /// Pages taken from the program break so far.
    pub fn pages(&self) -> usize {
        self.pages
    }

    pub fn growths(&self) -> usize {
        self.growths
    }

    /// Mappings currently alive.
    pub fn mappings(&self) -> usize {
        self.mappings
    }
}

impl HeapGrower for UnixHeapGrower {
    type Err = OsError;

    fn page_size(&self) -> usize {
        sysconf::page::pagesize()
    }

    unsafe fn grow_heap(&mut self, size: usize) -> Result<(*mut u8, usize), OsError> {
        if size == 0 {
            return Ok((null_mut(), 0));
        }
        let pagesize = self.page_size();
        let to_allocate = round_up(size, pagesize);
        if to_allocate > isize::MAX as usize {
            return Err(OsError {
                call: "sbrk",
                errno: Errno(libc::ENOMEM),
            });
        }

        let ptr = {
            let _break = BREAK.lock();
            libc::sbrk(to_allocate as libc::intptr_t)
        };
        if ptr as isize == -1 {
            return Err(OsError::last("sbrk"));
        }

        self.pages += to_allocate / pagesize;
        self.growths += 1;
        trace!("sbrk({}) -> {:?}", to_allocate, ptr);

        // The pool skips whatever it needs to align the start.
        Ok((ptr as *mut u8, to_allocate))
    }

    unsafe fn map_pages(&mut self, len: usize) -> Result<NonNull<u8>, OsError> {
        let len = round_up(len, self.page_size());
        let ptr = libc::mmap(
            // Address we want the memory at. We don't care, so null it is.
            null_mut(),
            len,
            libc::PROT_WRITE | libc::PROT_READ,
            // Not backed by a file, and not shared with any other process.
            libc::MAP_ANON | libc::MAP_PRIVATE,
            -1,
            0,
        );

        if ptr == libc::MAP_FAILED {
            return Err(OsError::last("mmap"));
        }
        self.mappings += 1;

        NonNull::new(ptr as *mut u8).ok_or(OsError {
            call: "mmap",
            errno: Errno(libc::ENOMEM),
        })
    }

    unsafe fn unmap_pages(&mut self, ptr: NonNull<u8>, len: usize) -> Result<(), OsError> {
        if libc::munmap(ptr.as_ptr() as *mut libc::c_void, len) != 0 {
            return Err(OsError::last("munmap"));
        }
        self.mappings -= 1;
        Ok(())
    }
}
