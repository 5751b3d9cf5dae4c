//! Process-group signal delivery.

use std::io;

use crate::domain::SignalKind;

fn raw_signal(kind: SignalKind) -> libc::c_int {
    match kind {
        SignalKind::Terminate => libc::SIGTERM,
        SignalKind::Kill => libc::SIGKILL,
        SignalKind::Stop => libc::SIGSTOP,
        SignalKind::Continue => libc::SIGCONT,
    }
}

fn checked_group(pgid: i32) -> io::Result<libc::pid_t> {
    // kill(-1) and kill(0) address every process we may signal, or our own group.
    if pgid <= 1 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to signal process group {pgid}"),
        ));
    }
    Ok(pgid)
}

/// Sends `kind` to every member of the group.
///
/// Returns `Ok(false)` when the group no longer exists.
pub fn signal_group(pgid: i32, kind: SignalKind) -> io::Result<bool> {
    let pgid = checked_group(pgid)?;
    // SAFETY: kill(2) takes plain integers and has no memory-safety preconditions.
    let rc = unsafe { libc::kill(-pgid, raw_signal(kind)) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ESRCH) => Ok(false),
        _ => Err(err),
    }
}

/// Whether any process (zombies included) is still a member of the group.
pub fn group_alive(pgid: i32) -> bool {
    let Ok(pgid) = checked_group(pgid) else {
        return false;
    };
    // SAFETY: signal 0 performs the permission and existence check only.
    let rc = unsafe { libc::kill(-pgid, 0) };
    if rc == 0 {
        return true;
    }
    // EPERM means members exist that we cannot signal.
    matches!(
        io::Error::last_os_error().raw_os_error(),
        Some(libc::EPERM)
    )
}
