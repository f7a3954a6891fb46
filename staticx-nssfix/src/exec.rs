//! Interception of the exec family.
//!
//! The vector-style primitives below carry all the logic; the variadic
//! front-ends (`execl`, `execle`, `execlp`) are C shims in `variadic.c`
//! that gather their arguments on the stack and call back in through the
//! `nssfix_*` exports. A process may legally exec from a signal handler, so
//! nothing on these paths may allocate: patched environments live entirely
//! in automatic storage, and the real primitives are resolved once at load
//! time.
//!
//! Re-injection rule: when the target is the literal `/proc/self/exe`
//! sentinel, or sits under the prefix named by
//! `NSSFIX_REINJECT_PATH_PREFIX`, the saved `LD_PRELOAD` goes back into the
//! child's environment — that child *is* the packaged executable, and must
//! get the helper again. Everything else execs with whatever environment
//! the caller supplied. PATH-searched bare names are never re-injected;
//! only an explicit path can name the packaged file. Any bookkeeping
//! overflow falls back to the unmodified real call.

use std::ffi::{c_char, c_int, CStr};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{PRELOAD_MAX, SAVED_PRELOAD};

/// Upper bound on environment entries in a re-injected environment.
const ENV_MAX: usize = 1024;

/// Room for `LD_PRELOAD=` plus the saved value plus the terminator.
const PRELOAD_ENTRY_MAX: usize = PRELOAD_MAX + 16;

const LD_PRELOAD_EQ: &CStr = c"LD_PRELOAD=";
const SELF_EXE: &CStr = c"/proc/self/exe";
const REINJECT_PREFIX_VAR: &CStr = c"NSSFIX_REINJECT_PATH_PREFIX";

type ExecveFn =
    unsafe extern "C" fn(*const c_char, *const *const c_char, *const *const c_char) -> c_int;
type ExecvFn = unsafe extern "C" fn(*const c_char, *const *const c_char) -> c_int;

static REAL_EXECVE: AtomicUsize = AtomicUsize::new(0);
static REAL_EXECV: AtomicUsize = AtomicUsize::new(0);
static REAL_EXECVP: AtomicUsize = AtomicUsize::new(0);
static REAL_EXECVPE: AtomicUsize = AtomicUsize::new(0);

extern "C" {
    fn execl(path: *const c_char, arg: *const c_char, ...) -> c_int;
    fn execle(path: *const c_char, arg: *const c_char, ...) -> c_int;
    fn execlp(file: *const c_char, arg: *const c_char, ...) -> c_int;
}

type VariadicExecFn = unsafe extern "C" fn(*const c_char, *const c_char, ...) -> c_int;

/// Keep the C front-ends linked into the cdylib even though nothing in Rust
/// calls them.
#[used]
static VARIADIC_FRONT_ENDS: [VariadicExecFn; 3] = [execl, execle, execlp];

/// Resolve the real primitives while we are still single-threaded and out
/// of signal context; dlsym is nothing to call during an interposed exec.
pub(crate) unsafe fn resolve_real() {
    resolve(&REAL_EXECVE, c"execve");
    resolve(&REAL_EXECV, c"execv");
    resolve(&REAL_EXECVP, c"execvp");
    resolve(&REAL_EXECVPE, c"execvpe");
}

unsafe fn resolve(slot: &AtomicUsize, name: &CStr) -> usize {
    let p = libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) as usize;
    slot.store(p, Ordering::Release);
    p
}

unsafe fn load(slot: &AtomicUsize, name: &CStr) -> usize {
    match slot.load(Ordering::Acquire) {
        // the constructor did not run (unusual load order); resolve late
        0 => resolve(slot, name),
        p => p,
    }
}

unsafe fn real_execve() -> Option<ExecveFn> {
    let p = load(&REAL_EXECVE, c"execve");
    (p != 0).then(|| std::mem::transmute::<usize, ExecveFn>(p))
}

unsafe fn real_execv() -> Option<ExecvFn> {
    let p = load(&REAL_EXECV, c"execv");
    (p != 0).then(|| std::mem::transmute::<usize, ExecvFn>(p))
}

unsafe fn real_execvp() -> Option<ExecvFn> {
    let p = load(&REAL_EXECVP, c"execvp");
    (p != 0).then(|| std::mem::transmute::<usize, ExecvFn>(p))
}

unsafe fn real_execvpe() -> Option<ExecveFn> {
    let p = load(&REAL_EXECVPE, c"execvpe");
    (p != 0).then(|| std::mem::transmute::<usize, ExecveFn>(p))
}

unsafe fn enosys() -> c_int {
    *libc::__errno_location() = libc::ENOSYS;
    -1
}

/// Whether an exec of `path` must get the saved pre-load back.
unsafe fn should_reinject(path: *const c_char) -> bool {
    if path.is_null() || SAVED_PRELOAD.get().is_none() {
        return false;
    }
    if libc::strcmp(path, SELF_EXE.as_ptr()) == 0 {
        return true;
    }
    let prefix = libc::getenv(REINJECT_PREFIX_VAR.as_ptr());
    if !prefix.is_null() {
        let len = libc::strlen(prefix);
        if len > 0 && libc::strncmp(path, prefix, len) == 0 {
            return true;
        }
    }
    false
}

unsafe fn contains_slash(path: *const c_char) -> bool {
    !path.is_null() && !libc::strchr(path, c_int::from(b'/')).is_null()
}

/// Copy `envp` into `entries` minus any existing `LD_PRELOAD`, then append
/// one rebuilt from `saved` in `preload_entry`. `None` when a bound would
/// be exceeded; the caller then falls back to the unmodified call.
unsafe fn build_reinjected_env(
    envp: *const *const c_char,
    saved: &[u8],
    entries: &mut [*const c_char; ENV_MAX],
    preload_entry: &mut [u8; PRELOAD_ENTRY_MAX],
) -> Option<()> {
    let key = LD_PRELOAD_EQ.to_bytes();
    if key.len() + saved.len() + 1 > PRELOAD_ENTRY_MAX {
        return None;
    }
    preload_entry[..key.len()].copy_from_slice(key);
    preload_entry[key.len()..key.len() + saved.len()].copy_from_slice(saved);
    preload_entry[key.len() + saved.len()] = 0;

    let mut n = 0;
    if !envp.is_null() {
        let mut cursor = envp;
        while !(*cursor).is_null() {
            let entry = *cursor;
            cursor = cursor.add(1);
            if libc::strncmp(entry, LD_PRELOAD_EQ.as_ptr(), key.len()) == 0 {
                continue;
            }
            if n >= ENV_MAX - 2 {
                return None;
            }
            entries[n] = entry;
            n += 1;
        }
    }
    entries[n] = preload_entry.as_ptr().cast();
    entries[n + 1] = ptr::null();
    Some(())
}

/// Exec through `real` with the pre-load re-introduced. Only returns if the
/// exec itself failed or a bound was exceeded.
unsafe fn exec_reinjected(
    real: ExecveFn,
    path: *const c_char,
    argv: *const *const c_char,
    envp: *const *const c_char,
) -> Option<c_int> {
    let saved = SAVED_PRELOAD.get()?;
    let mut entries = [ptr::null(); ENV_MAX];
    let mut preload_entry = [0u8; PRELOAD_ENTRY_MAX];
    build_reinjected_env(envp, saved, &mut entries, &mut preload_entry)?;
    Some(real(path, argv, entries.as_ptr()))
}

extern "C" {
    static environ: *mut *mut c_char;
}

/// The caller's environment, for the primitives that inherit it.
unsafe fn caller_environ() -> *const *const c_char {
    environ as *const *const c_char
}

/// execve(2): by path, caller-supplied environment.
///
/// # Safety
/// Standard exec contract: `path` is a NUL-terminated string, `argv` and
/// `envp` are NULL-terminated arrays of such strings.
#[no_mangle]
pub unsafe extern "C" fn execve(
    path: *const c_char,
    argv: *const *const c_char,
    envp: *const *const c_char,
) -> c_int {
    let Some(real) = real_execve() else {
        return enosys();
    };
    if should_reinject(path) {
        if let Some(rc) = exec_reinjected(real, path, argv, envp) {
            return rc;
        }
    }
    real(path, argv, envp)
}

/// execv(3): by path, inherited environment.
///
/// # Safety
/// Standard exec contract, as for [`execve`].
#[no_mangle]
pub unsafe extern "C" fn execv(path: *const c_char, argv: *const *const c_char) -> c_int {
    if should_reinject(path) {
        if let Some(real) = real_execve() {
            if let Some(rc) = exec_reinjected(real, path, argv, caller_environ()) {
                return rc;
            }
        }
    }
    let Some(real) = real_execv() else {
        return enosys();
    };
    real(path, argv)
}

/// execvpe(3): PATH search, caller-supplied environment.
///
/// # Safety
/// Standard exec contract, as for [`execve`].
#[no_mangle]
pub unsafe extern "C" fn execvpe(
    file: *const c_char,
    argv: *const *const c_char,
    envp: *const *const c_char,
) -> c_int {
    let Some(real) = real_execvpe() else {
        return enosys();
    };
    if contains_slash(file) && should_reinject(file) {
        if let Some(rc) = exec_reinjected(real, file, argv, envp) {
            return rc;
        }
    }
    real(file, argv, envp)
}

/// execvp(3): PATH search, inherited environment.
///
/// # Safety
/// Standard exec contract, as for [`execve`].
#[no_mangle]
pub unsafe extern "C" fn execvp(file: *const c_char, argv: *const *const c_char) -> c_int {
    if contains_slash(file) && should_reinject(file) {
        if let Some(real) = real_execvpe() {
            if let Some(rc) = exec_reinjected(real, file, argv, caller_environ()) {
                return rc;
            }
        }
    }
    let Some(real) = real_execvp() else {
        return enosys();
    };
    real(file, argv)
}

/// Entry point for the `execl` shim in `variadic.c`.
///
/// # Safety
/// Standard exec contract, as for [`execve`].
#[no_mangle]
pub unsafe extern "C" fn nssfix_execv(path: *const c_char, argv: *const *const c_char) -> c_int {
    execv(path, argv)
}

/// Entry point for the `execle` shim in `variadic.c`.
///
/// # Safety
/// Standard exec contract, as for [`execve`].
#[no_mangle]
pub unsafe extern "C" fn nssfix_execve(
    path: *const c_char,
    argv: *const *const c_char,
    envp: *const *const c_char,
) -> c_int {
    execve(path, argv, envp)
}

/// Entry point for the `execlp` shim in `variadic.c`.
///
/// # Safety
/// Standard exec contract, as for [`execve`].
#[no_mangle]
pub unsafe extern "C" fn nssfix_execvp(file: *const c_char, argv: *const *const c_char) -> c_int {
    execvp(file, argv)
}
