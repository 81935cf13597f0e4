//! POSIX signal delivery to agent processes.
//!
//! Agents are spawned as process-group leaders, so the group id equals the
//! agent's pid and a group signal also reaches tools the agent started.

use std::io;

/// Outcome of a signal send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// The target had already exited (`ESRCH`).
    Gone,
}

/// Send SIGTERM to a single process.
pub fn terminate(pid: u32) -> io::Result<Delivery> {
    send(pid_t(pid)?, libc::SIGTERM)
}

/// Send SIGTERM to every process in the group led by `pgid`.
pub fn terminate_group(pgid: u32) -> io::Result<Delivery> {
    send(-pid_t(pgid)?, libc::SIGTERM)
}

/// Send SIGKILL to every process in the group led by `pgid`.
pub fn kill_group(pgid: u32) -> io::Result<Delivery> {
    send(-pid_t(pgid)?, libc::SIGKILL)
}

fn pid_t(pid: u32) -> io::Result<libc::pid_t> {
    match libc::pid_t::try_from(pid) {
        Ok(p) if p > 0 => Ok(p),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid pid {}", pid),
        )),
    }
}

fn send(target: libc::pid_t, signal: libc::c_int) -> io::Result<Delivery> {
    // SAFETY: kill(2) has no memory-safety preconditions; target is never 0
    // or -1, so it cannot address the caller's own group or every process.
    let rc = unsafe { libc::kill(target, signal) };
    if rc == 0 {
        return Ok(Delivery::Sent);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(Delivery::Gone)
    } else {
        Err(err)
    }
}
