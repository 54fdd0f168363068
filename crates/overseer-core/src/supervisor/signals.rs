//! OS signals sent to the agent.
//!
//! Pause, resume and terminate go to the agent's pid only; a hard kill
//! goes to its whole process group so helpers holding the stdout pipe die
//! with it.

use std::io;

/// Signals the supervisor sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentSignal {
    /// Finish the current iteration, then wait (`SIGUSR1`).
    Pause,
    /// Continue after a pause (`SIGUSR2`).
    Resume,
    /// Shut down cleanly (`SIGTERM`).
    Terminate,
    /// `SIGKILL`, delivered to the process group.
    Kill,
}

impl AgentSignal {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pause => "SIGUSR1",
            Self::Resume => "SIGUSR2",
            Self::Terminate => "SIGTERM",
            Self::Kill => "SIGKILL",
        }
    }

    #[cfg(unix)]
    fn raw(&self) -> libc::c_int {
        match self {
            Self::Pause => libc::SIGUSR1,
            Self::Resume => libc::SIGUSR2,
            Self::Terminate => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
        }
    }
}

impl std::fmt::Display for AgentSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// No such process; it has already exited.
    AlreadyExited,
}

/// Send `signal` to the agent. [`AgentSignal::Kill`] targets the process
/// group led by `pid`.
#[cfg(unix)]
pub fn send(pid: u32, signal: AgentSignal) -> io::Result<Delivery> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    let target = if signal == AgentSignal::Kill { -pid } else { pid };

    // SAFETY: kill(2) has no memory-safety preconditions.
    let ret = unsafe { libc::kill(target, signal.raw()) };
    if ret == 0 {
        return Ok(Delivery::Delivered);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(Delivery::AlreadyExited)
    } else {
        Err(err)
    }
}

#[cfg(not(unix))]
pub fn send(_pid: u32, signal: AgentSignal) -> io::Result<Delivery> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("{signal} is not supported on this platform"),
    ))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn missing_process_is_already_exited() {
        // Reap a short-lived child so its pid is known to be free.
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert_eq!(send(pid, AgentSignal::Pause).unwrap(), Delivery::AlreadyExited);
    }

    #[test]
    fn terminate_reaches_a_live_process() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        assert_eq!(
            send(child.id(), AgentSignal::Terminate).unwrap(),
            Delivery::Delivered
        );
        let status = child.wait().unwrap();
        assert!(!status.success());
    }
}
