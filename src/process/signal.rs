//! Thin signal wrappers
//!
//! "No such process" is not an error here: the target exiting on its own
//! between discovery and delivery is the common case during teardown.

#[cfg(unix)]
mod imp {
    use std::io;

    fn check(rc: libc::c_int) -> io::Result<()> {
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            Ok(())
        } else {
            Err(err)
        }
    }

    pub fn terminate(pid: u32) -> io::Result<()> {
        check(unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) })
    }

    pub fn kill(pid: u32) -> io::Result<()> {
        check(unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) })
    }

    pub fn terminate_group(pgid: u32) -> io::Result<()> {
        check(unsafe { libc::killpg(pgid as libc::pid_t, libc::SIGTERM) })
    }

    pub fn kill_group(pgid: u32) -> io::Result<()> {
        check(unsafe { libc::killpg(pgid as libc::pid_t, libc::SIGKILL) })
    }
}

#[cfg(not(unix))]
mod imp {
    use std::io;

    // Without POSIX signals the supervisor falls back to Child::kill on the root
    pub fn terminate(_pid: u32) -> io::Result<()> {
        Ok(())
    }

    pub fn kill(_pid: u32) -> io::Result<()> {
        Ok(())
    }

    pub fn terminate_group(_pgid: u32) -> io::Result<()> {
        Ok(())
    }

    pub fn kill_group(_pgid: u32) -> io::Result<()> {
        Ok(())
    }
}

pub(crate) use imp::{kill, kill_group, terminate, terminate_group};
