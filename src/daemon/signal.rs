// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Termination signals.
//!
//! The handlers only record that a shutdown was requested and kick the wakeup event, so a
//! blocked wait returns. The daemon loop notices the flag and shuts down on its own terms.

use std::mem;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use libc::{c_int, c_void, siginfo_t};
use vmm_sys_util::errno;
use vmm_sys_util::signal::register_signal_handler;

/// Signals that end the session.
pub const TERMINATION_SIGNALS: [c_int; 2] = [libc::SIGHUP, libc::SIGTERM];

static SHUTDOWN: AtomicBool = AtomicBool::new(false);
static WAKEUP_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn handle_termination(_num: c_int, _info: *mut siginfo_t, _unused: *mut c_void) {
    SHUTDOWN.store(true, Ordering::SeqCst);

    let fd = WAKEUP_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let one: u64 = 1;
        // SAFETY: write(2) is async-signal-safe and only reads the 8 bytes of `one`. A failure
        // leaves the flag set, which the loop still sees after its next wakeup.
        unsafe {
            libc::write(
                fd,
                &one as *const u64 as *const c_void,
                mem::size_of::<u64>(),
            );
        }
    }
}

/// Installs the termination handlers and returns the flag they raise.
///
/// `wakeup_fd`, when given, must be an eventfd that stays open for the rest of the process.
pub fn install(wakeup_fd: Option<RawFd>) -> errno::Result<&'static AtomicBool> {
    WAKEUP_FD.store(wakeup_fd.unwrap_or(-1), Ordering::SeqCst);
    for &num in TERMINATION_SIGNALS.iter() {
        register_signal_handler(num, handle_termination)?;
    }
    Ok(&SHUTDOWN)
}
