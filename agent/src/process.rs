//! Process and thread introspection

use std::path::Path;

/// Basename of the executable of `pid`, or an empty string when unknown
pub fn process_name(pid: u32) -> String {
    std::fs::read(format!("/proc/{}/cmdline", pid))
        .ok()
        .and_then(|cmdline| {
            let argv0 = cmdline.split(|b| *b == 0).next()?;
            let argv0 = String::from_utf8_lossy(argv0).into_owned();
            Path::new(&argv0)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
        })
        .unwrap_or_default()
}

/// Name of a thread in this process, or an empty string when unknown
pub fn thread_name(sys_tid: i32) -> String {
    std::fs::read_to_string(format!("/proc/self/task/{}/comm", sys_tid))
        .map(|comm| comm.trim_end().to_string())
        .unwrap_or_default()
}

/// Kernel thread id of the calling thread
#[cfg(target_os = "linux")]
pub fn current_thread_id() -> i32 {
    // SAFETY: gettid takes no arguments and cannot fail
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}

#[cfg(not(target_os = "linux"))]
pub fn current_thread_id() -> i32 {
    std::process::id() as i32
}

/// Low 32 bits of the calling thread's pthread handle, the key backends
/// report API calls under
#[cfg(unix)]
pub fn current_thread_key() -> i32 {
    // SAFETY: pthread_self has no preconditions
    unsafe { libc::pthread_self() as usize as u32 as i32 }
}

#[cfg(not(unix))]
pub fn current_thread_key() -> i32 {
    current_thread_id()
}

/// Host name reported in trace metadata
pub fn host_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| format!("host-{}", std::process::id()))
}
