//! Running the patched program and mirroring its fate.
//!
//! The parent's only job after fork is to be transparent: forward the
//! terminating signals it receives to the child, wait out interruptions,
//! then either exit with the child's code or re-raise the signal that
//! killed it so the shell observes exactly what the program alone would
//! have shown it.

use std::ffi::{CString, OsString};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::process;
use std::sync::atomic::{AtomicI32, Ordering};

use nix::errno::Errno;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{execv, fork, ForkResult};
use tracing::debug;

use staticx_core::Error;

/// How the child ended.
pub enum ChildStatus {
    /// Normal exit with this code.
    Exited(i32),

    /// Killed by this signal.
    Signaled(Signal),
}

/// Signals forwarded to the child while we wait: the catchable signals
/// whose default disposition terminates. KILL and STOP cannot be caught.
const FORWARDED_SIGNALS: [Signal; 8] = [
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGPIPE,
    Signal::SIGALRM,
    Signal::SIGTERM,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
];

/// Pid of the running child; 0 means no child.
static CHILD_PID: AtomicI32 = AtomicI32::new(0);

/// Relay a signal to the child. Runs in signal context: nothing here but an
/// atomic load and kill(2).
extern "C" fn forward_signal(signo: libc::c_int) {
    let pid = CHILD_PID.load(Ordering::SeqCst);
    if pid > 0 {
        unsafe {
            libc::kill(pid, signo);
        }
    }
}

/// Fork, exec `prog` with `args` appended to it, wait, and report how the
/// child ended. Forwarding handlers are live only between a successful fork
/// and the end of the wait.
pub fn run(prog: &Path, args: &[OsString]) -> Result<ChildStatus, Error> {
    let prog_c = cstring(prog.as_os_str().as_bytes())?;
    let mut argv = Vec::with_capacity(args.len() + 1);
    argv.push(prog_c.clone());
    for arg in args {
        argv.push(cstring(arg.as_bytes())?);
    }

    match unsafe { fork() }? {
        ForkResult::Child => {
            // the Rust runtime ignores SIGPIPE process-wide and ignored
            // dispositions survive exec; the program expects the default
            let dfl = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
            unsafe {
                let _ = signal::sigaction(Signal::SIGPIPE, &dfl);
            }
            let err = execv(&prog_c, &argv).unwrap_err();
            eprintln!(
                "staticx-bootloader: failed to execute {}: {}",
                prog.display(),
                err
            );
            process::exit(3);
        }
        ForkResult::Parent { child } => {
            debug!(pid = child.as_raw(), "child started");
            CHILD_PID.store(child.as_raw(), Ordering::SeqCst);
            install_forwarders();

            let status = loop {
                match waitpid(child, None) {
                    Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => {
                        break status;
                    }
                    Ok(other) => {
                        debug!(?other, "ignoring wait status");
                        continue;
                    }
                    Err(Errno::EINTR) => continue,
                    Err(err) => {
                        restore_defaults();
                        CHILD_PID.store(0, Ordering::SeqCst);
                        return Err(err.into());
                    }
                }
            };

            restore_defaults();
            CHILD_PID.store(0, Ordering::SeqCst);

            match status {
                WaitStatus::Exited(_, code) => {
                    debug!(code, "child exited");
                    Ok(ChildStatus::Exited(code))
                }
                WaitStatus::Signaled(_, sig, core_dumped) => {
                    debug!(signal = ?sig, core_dumped, "child died from signal");
                    Ok(ChildStatus::Signaled(sig))
                }
                _ => unreachable!("wait loop only breaks on exit or signal"),
            }
        }
    }
}

/// Mirror the child's signal death: default disposition back in place,
/// then the same signal against ourselves.
pub fn die_with_signal(sig: Signal) -> ! {
    let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    unsafe {
        let _ = signal::sigaction(sig, &action);
    }
    let _ = signal::raise(sig);
    // only reachable if the signal is blocked at a level we cannot undo;
    // fall back to the conventional shell encoding
    process::exit(128 + sig as i32);
}

fn install_forwarders() {
    let action = SigAction::new(
        SigHandler::Handler(forward_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for sig in FORWARDED_SIGNALS {
        // only fails for invalid signal numbers
        unsafe {
            let _ = signal::sigaction(sig, &action);
        }
    }
}

fn restore_defaults() {
    let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for sig in FORWARDED_SIGNALS {
        unsafe {
            let _ = signal::sigaction(sig, &action);
        }
    }
}

fn cstring(bytes: &[u8]) -> Result<CString, Error> {
    CString::new(bytes).map_err(|_| {
        Error::IO(io::Error::new(
            io::ErrorKind::InvalidInput,
            "NUL byte in exec argument",
        ))
    })
}
