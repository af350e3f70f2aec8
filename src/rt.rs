//! Default realtime-priority hook for the driver threads.

#[cfg(unix)]
use nix::libc;

/// Priority handed to the default hook when the host does not pick one.
pub const DEFAULT_RT_PRIORITY: i32 = 18;

/// Raise the calling thread to `SCHED_FIFO` at `priority`. Installed as the
/// context hook when the host does not provide one.
pub fn set_thread_rt_priority(priority: i32) -> Result<(), String> {
    #[cfg(unix)]
    {
        let thread = unsafe { libc::pthread_self() };
        let param = unsafe {
            let mut p = std::mem::zeroed::<libc::sched_param>();
            p.sched_priority = priority;
            p
        };
        let rc = unsafe { libc::pthread_setschedparam(thread, libc::SCHED_FIFO, &param) };
        if rc != 0 {
            return Err(format!(
                "pthread_setschedparam(SCHED_FIFO, prio {priority}) failed with errno {rc}"
            ));
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = priority;
        Err("realtime thread priority is not supported on this platform".to_string())
    }
}
