//! Interrupt handling (SIGINT / Ctrl-C).
//!
//! The first interrupt reaches child processes too, which ought to fail
//! their tasks; we stop dispatching new work, let running tasks finish and
//! still write out the signature store.  A second interrupt kills us.

use std::sync::atomic::{AtomicBool, Ordering};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Whether an interrupt arrived since the handler was registered.
pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

#[cfg(unix)]
mod imp {
    use super::INTERRUPTED;
    use std::sync::atomic::Ordering;

    fn sigint_action(handler: libc::sighandler_t) {
        // Safety: registering a signal handler is libc unsafe code.
        unsafe {
            let mut sa: libc::sigaction = std::mem::zeroed();
            sa.sa_sigaction = handler;
            libc::sigaction(libc::SIGINT, &sa, std::ptr::null_mut());
        }
    }

    extern "C" fn sigint_handler(_sig: libc::c_int) {
        INTERRUPTED.store(true, Ordering::Relaxed);
        sigint_action(libc::SIG_DFL);
    }

    pub fn register_sigint() {
        sigint_action(sigint_handler as libc::sighandler_t);
    }
}

#[cfg(windows)]
mod imp {
    use super::INTERRUPTED;
    use std::sync::atomic::Ordering;
    use windows_sys::Win32::System::Console::{SetConsoleCtrlHandler, CTRL_C_EVENT};

    unsafe extern "system" fn ctrl_handler(ctrl_type: u32) -> i32 {
        if ctrl_type == CTRL_C_EVENT && !INTERRUPTED.swap(true, Ordering::Relaxed) {
            return 1;
        }
        0
    }

    pub fn register_sigint() {
        // Safety: installs a handler that only touches an atomic.
        unsafe {
            SetConsoleCtrlHandler(Some(ctrl_handler), 1);
        }
    }
}

pub use imp::register_sigint;
