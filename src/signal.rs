//! Wakeup-signal plumbing for the event loop.
//!
//! The dispatcher sleeps in `epoll_pwait` with one realtime signal
//! unblocked; delivering that signal to the event thread is the only
//! wakeup mechanism. The handler itself does nothing but inspect a few
//! atomics (see the dispatcher), so everything here is async-signal-safe.

use std::io;
use std::mem;

/// Default wakeup signal: the first couple of realtime signals are left
/// for runtimes which claim them.
pub(crate) fn default_signum() -> libc::c_int { libc::SIGRTMIN() + 2 }

/// Install `handler` as the process-wide handler for `signum`.
pub(crate) fn install_handler(
    signum: libc::c_int,
    handler: extern "C" fn(libc::c_int),
) -> io::Result<()> {
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = handler as usize;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(signum, &action, std::ptr::null_mut()) == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Restore the default disposition for `signum`.
pub(crate) fn restore_default(signum: libc::c_int) {
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = libc::SIG_DFL;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(signum, &action, std::ptr::null_mut());
    }
}

/// Block `signum` on the calling thread and return the previous mask,
/// which keeps the signal unblocked and is the mask to use inside
/// `epoll_pwait`.
pub(crate) fn block_on_current_thread(signum: libc::c_int) -> io::Result<libc::sigset_t> {
    unsafe {
        let mut block: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut block);
        libc::sigaddset(&mut block, signum);
        let mut previous: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut previous);
        if libc::pthread_sigmask(libc::SIG_BLOCK, &block, &mut previous) != 0 {
            return Err(io::Error::last_os_error());
        }
        libc::sigdelset(&mut previous, signum);
        Ok(previous)
    }
}

/// Deliver `signum` to a specific thread.
pub(crate) fn kill_thread(thread: libc::pthread_t, signum: libc::c_int) {
    unsafe { libc::pthread_kill(thread, signum) };
}
