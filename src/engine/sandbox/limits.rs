//! Resource ceilings applied inside the forked child before `exec`, and
//! process-group teardown from the parent.
//!
//! Everything called from `pre_exec` runs between fork and exec, so it is
//! restricted to plain syscalls: no allocation, no locks, no logging.

use nix::{
    errno::Errno,
    libc::rlim_t,
    sys::{
        resource::{Resource, setrlimit},
        signal::{Signal, killpg},
    },
    unistd::{Pid, setpgid},
};

#[derive(Debug, Clone, Copy)]
pub(super) struct ChildLimits {
    /// `None` leaves the address space unbounded (watchdog mode).
    pub address_space_bytes: Option<u64>,
    /// Soft CPU limit. The hard limit sits one second above it so the kernel
    /// delivers SIGXCPU first; at the hard limit it sends SIGKILL, which would
    /// read as a memory kill.
    pub cpu_secs: u64,
    /// Disk ceiling for anything the child writes, the merged output included.
    pub file_size_bytes: u64,
}

impl ChildLimits {
    pub(super) fn apply(&self) -> std::io::Result<()> {
        own_process_group()?;

        if let Some(bytes) = self.address_space_bytes {
            set_both(Resource::RLIMIT_AS, bytes)?;
            set_both(Resource::RLIMIT_DATA, bytes)?;
        }
        set_pair(
            Resource::RLIMIT_CPU,
            self.cpu_secs,
            self.cpu_secs.saturating_add(1),
        )?;
        set_both(Resource::RLIMIT_FSIZE, self.file_size_bytes)?;
        set_both(Resource::RLIMIT_CORE, 0)?;
        Ok(())
    }
}

/// Moves the calling process into a fresh process group led by itself, so the
/// parent can signal it together with everything it forks.
pub(super) fn own_process_group() -> std::io::Result<()> {
    setpgid(Pid::from_raw(0), Pid::from_raw(0))?;
    Ok(())
}

/// SIGKILLs a whole process group. A group that already vanished is not an error.
pub(super) fn kill_group(pgid: u32) {
    let Ok(raw) = i32::try_from(pgid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => tracing::warn!(pgid, error = %err, "failed to kill process group"),
    }
}

/// Kills the process group it guards when dropped, so a run abandoned
/// mid-flight still takes its descendants down with it.
pub(super) struct GroupGuard {
    pgid: u32,
}

impl GroupGuard {
    pub(super) fn new(pgid: u32) -> Self {
        Self { pgid }
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        kill_group(self.pgid);
    }
}

fn set_both(resource: Resource, value: u64) -> std::io::Result<()> {
    set_pair(resource, value, value)
}

fn set_pair(resource: Resource, soft: u64, hard: u64) -> std::io::Result<()> {
    setrlimit(resource, soft as rlim_t, hard as rlim_t)?;
    Ok(())
}
