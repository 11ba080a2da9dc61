//! Processor queries and thread affinity
//!
//! Affinity is best-effort everywhere: schedulers log a failed pin and keep
//! the worker unpinned rather than refusing to run.

use crate::error::Result;

/// Number of logical cores available to the process.
pub fn logical_cores() -> usize {
    num_cpus::get()
}

/// Pins the calling thread to logical core `core` (wrapped into range).
#[cfg(target_os = "linux")]
pub fn pin_current_thread(core: usize) -> Result<()> {
    use crate::error::SchedError;

    let core = core % logical_cores().max(1);
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(SchedError::Affinity(
                std::io::Error::last_os_error().to_string(),
            ));
        }
    }
    Ok(())
}

/// Pins the calling thread to logical core `core` (wrapped into range).
#[cfg(windows)]
pub fn pin_current_thread(core: usize) -> Result<()> {
    use crate::error::SchedError;
    use windows_sys::Win32::System::Threading::{GetCurrentThread, SetThreadAffinityMask};

    let mask = 1usize << (core % (usize::BITS as usize));
    let previous = unsafe { SetThreadAffinityMask(GetCurrentThread(), mask) };
    if previous == 0 {
        return Err(SchedError::Affinity(
            "SetThreadAffinityMask failed".to_string(),
        ));
    }
    Ok(())
}

/// Pins the calling thread to logical core `core`.
#[cfg(not(any(target_os = "linux", windows)))]
pub fn pin_current_thread(_core: usize) -> Result<()> {
    use crate::error::SchedError;

    Err(SchedError::Affinity(
        "thread pinning is not supported on this platform".to_string(),
    ))
}
