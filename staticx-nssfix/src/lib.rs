//! libnssfix — in-process name-service pinning for packaged executables.
//!
//! Built as `libnssfix.so` and injected into the user program through
//! `LD_PRELOAD`. A packaged program carries its own glibc in the bundle, so
//! letting it parse the host's `/etc/nsswitch.conf` would load host NSS
//! plugins built against a different libc. The constructor here runs before
//! the first lookup and pins every database to a fixed policy instead:
//! `files` everywhere, `files dns` for `hosts` (the helper links against
//! `libnss_files` and `libnss_dns`).
//!
//! The constructor also saves and unsets `LD_PRELOAD`, so ordinary children
//! of the user program never load the helper. The [`exec`] interceptors put
//! the saved value back for exactly one case: the program re-executing the
//! packaged file itself.

use std::cell::UnsafeCell;
use std::ffi::{c_char, c_int, CStr};
use std::sync::atomic::{AtomicUsize, Ordering};

mod exec;

extern "C" {
    // glibc's private hook for overriding what nsswitch.conf would decide
    fn __nss_configure_lookup(dbname: *const c_char, service_line: *const c_char) -> c_int;
}

/// Every glibc name-service database and the service line it is pinned to.
/// <https://github.com/bminor/glibc/blob/glibc-2.31/nss/databases.def>
static DATABASES: [(&CStr, &CStr); 14] = [
    (c"aliases", c"files"),
    (c"ethers", c"files"),
    (c"group", c"files"),
    (c"gshadow", c"files"),
    (c"hosts", c"files dns"),
    (c"initgroups", c"files"),
    (c"netgroup", c"files"),
    (c"networks", c"files"),
    (c"passwd", c"files"),
    (c"protocols", c"files"),
    (c"publickey", c"files"),
    (c"rpc", c"files"),
    (c"services", c"files"),
    (c"shadow", c"files"),
];

const LD_PRELOAD: &CStr = c"LD_PRELOAD";

/// Longest `LD_PRELOAD` value the helper can save and re-inject.
pub(crate) const PRELOAD_MAX: usize = 4096;

/// The `LD_PRELOAD` value observed at load time, copied into static storage
/// so the exec paths never touch the allocator.
pub(crate) struct SavedPreload {
    buf: UnsafeCell<[u8; PRELOAD_MAX]>,
    len: AtomicUsize,
}

// written once from the constructor before main, read-only afterwards
unsafe impl Sync for SavedPreload {}

pub(crate) static SAVED_PRELOAD: SavedPreload = SavedPreload {
    buf: UnsafeCell::new([0; PRELOAD_MAX]),
    len: AtomicUsize::new(0),
};

impl SavedPreload {
    /// The saved value, if any.
    pub(crate) fn get(&self) -> Option<&[u8]> {
        let len = self.len.load(Ordering::Acquire);
        if len == 0 {
            return None;
        }
        let buf = unsafe { &*self.buf.get() };
        Some(&buf[..len])
    }

    unsafe fn capture(&self) {
        let value = libc::getenv(LD_PRELOAD.as_ptr());
        if value.is_null() {
            return;
        }
        let len = libc::strlen(value);
        if len == 0 || len >= PRELOAD_MAX {
            return;
        }
        let buf = &mut *self.buf.get();
        std::ptr::copy_nonoverlapping(value.cast::<u8>(), buf.as_mut_ptr(), len);
        self.len.store(len, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn set_for_tests(&self, value: &[u8]) {
        assert!(value.len() < PRELOAD_MAX);
        let buf = unsafe { &mut *self.buf.get() };
        buf[..value.len()].copy_from_slice(value);
        self.len.store(value.len(), Ordering::Release);
    }
}

#[used]
#[link_section = ".init_array"]
static INIT: extern "C" fn() = init;

/// Runs before the program's `main`, and before anything can do a lookup.
extern "C" fn init() {
    unsafe {
        SAVED_PRELOAD.capture();
        // ordinary children of the user program must not load the helper
        libc::unsetenv(LD_PRELOAD.as_ptr());
        exec::resolve_real();
        configure_nss();
    }
}

unsafe fn configure_nss() {
    for (db, service_line) in DATABASES {
        if __nss_configure_lookup(db.as_ptr(), service_line.as_ptr()) != 0 {
            // report and carry on; a database that cannot be pinned beats
            // aborting the program over one
            eprintln!(
                "nssfix: __nss_configure_lookup({:?}, {:?}) failed",
                db, service_line
            );
        }
    }
}
