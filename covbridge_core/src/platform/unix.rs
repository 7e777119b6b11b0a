//! SysV shared memory, FIFO notifications and `SIGSEGV` interception on top of `libc`.

use super::{
    ChannelHandle, FaultDisposition, FaultHook, FaultInfo, Platform, PlatformError, SharedRegion,
};
use libc::{c_int, c_void, siginfo_t};
use std::ffi::CStr;
use std::mem;
use std::ptr;
use std::sync::OnceLock;

/// Owner read/write, as AFL creates its coverage segments.
const SHM_MODE: c_int = 0o600;

/// Hook invoked from [`handle_fault`]. Set once, read from signal context.
static FAULT_HOOK: OnceLock<&'static dyn FaultHook> = OnceLock::new();

/// Disposition of `SIGSEGV` before we installed ours; restored before forwarding.
static PREVIOUS_ACTION: OnceLock<libc::sigaction> = OnceLock::new();

/// A SysV segment attached with `shmat`.
///
/// Dropping detaches the mapping. The segment itself is never removed: its lifetime belongs
/// to the fuzzer that published the id.
#[derive(Debug)]
pub struct SysVRegion {
    id: i32,
    map: *mut u8,
    size: usize,
}

// The mapping is process-wide memory; concurrent access goes through atomics in `CoverageMap`.
unsafe impl Send for SysVRegion {}
unsafe impl Sync for SysVRegion {}

impl SharedRegion for SysVRegion {
    fn id(&self) -> i32 {
        self.id
    }

    fn as_mut_ptr(&self) -> *mut u8 {
        self.map
    }

    fn len(&self) -> usize {
        self.size
    }
}

impl Drop for SysVRegion {
    fn drop(&mut self) {
        unsafe {
            libc::shmdt(self.map as *const c_void);
        }
    }
}

/// [`Platform`] for Linux and other SysV-IPC capable unices.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixPlatform;

impl UnixPlatform {
    pub fn new() -> Self {
        UnixPlatform
    }
}

impl Platform for UnixPlatform {
    fn attach_shared_region(
        &self,
        key: i32,
        size: usize,
    ) -> Result<Box<dyn SharedRegion>, PlatformError> {
        unsafe {
            // Create by key first; if the fuzzer already did, look it up instead.
            let mut os_id = libc::shmget(
                key as libc::key_t,
                size,
                libc::IPC_CREAT | libc::IPC_EXCL | SHM_MODE,
            );
            if os_id < 0 {
                os_id = libc::shmget(key as libc::key_t, size, SHM_MODE);
            }
            if os_id < 0 {
                return Err(PlatformError::last_os_error("shmget"));
            }

            let map = libc::shmat(os_id, ptr::null(), 0);
            if map.is_null() || map as isize == -1 {
                return Err(PlatformError::last_os_error("shmat"));
            }

            Ok(Box::new(SysVRegion {
                id: os_id,
                map: map.cast::<u8>(),
                size,
            }))
        }
    }

    fn open_notification_channel(&self, name: &CStr) -> Result<ChannelHandle, PlatformError> {
        // Non-blocking so a controller that is not listening can never stall the target.
        let fd = unsafe {
            libc::open(
                name.as_ptr(),
                libc::O_WRONLY | libc::O_NONBLOCK | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(PlatformError::last_os_error("open"));
        }
        Ok(ChannelHandle::from(fd))
    }

    fn write_notification(&self, handle: ChannelHandle, byte: u8) -> Result<(), PlatformError> {
        let fd = c_int::try_from(handle).map_err(|_| PlatformError::Os {
            op: "write",
            errno: libc::EBADF,
        })?;
        // A controller that hung up turns the write into SIGPIPE, which would kill the target.
        let _pipe_guard = SigpipeBlock::new();
        write_byte(fd, byte)
    }

    fn close_notification_channel(&self, handle: ChannelHandle) {
        if let Ok(fd) = c_int::try_from(handle) {
            unsafe {
                libc::close(fd);
            }
        }
    }

    fn register_fault_handler(&self, hook: &'static dyn FaultHook) -> Result<(), PlatformError> {
        FAULT_HOOK
            .set(hook)
            .map_err(|_| PlatformError::AlreadyRegistered)?;

        unsafe {
            let mut previous: libc::sigaction = mem::zeroed();
            if libc::sigaction(libc::SIGSEGV, ptr::null(), &raw mut previous) < 0 {
                return Err(PlatformError::last_os_error("sigaction"));
            }
            let _ = PREVIOUS_ACTION.set(previous);

            let mut action: libc::sigaction = mem::zeroed();
            libc::sigemptyset(&raw mut action.sa_mask);
            action.sa_flags = libc::SA_SIGINFO;
            action.sa_sigaction = handle_fault as *const () as libc::sighandler_t;
            if libc::sigaction(libc::SIGSEGV, &raw const action, ptr::null_mut()) < 0 {
                return Err(PlatformError::last_os_error("sigaction"));
            }
        }
        Ok(())
    }
}

fn write_byte(fd: c_int, byte: u8) -> Result<(), PlatformError> {
    loop {
        let written = unsafe { libc::write(fd, (&raw const byte).cast::<c_void>(), 1) };
        if written == 1 {
            return Ok(());
        }
        let err = PlatformError::last_os_error("write");
        match err {
            PlatformError::Os { errno, .. } if errno == libc::EINTR => continue,
            _ => return Err(err),
        }
    }
}

/// Blocks `SIGPIPE` for the calling thread while alive.
///
/// On drop, a `SIGPIPE` raised in the meantime is discarded and the previous mask restored.
/// One that was already pending on entry is left alone. Only async-signal-safe calls are
/// made, so this is usable from the fault handler.
struct SigpipeBlock {
    previous: libc::sigset_t,
    was_pending: bool,
}

impl SigpipeBlock {
    fn new() -> Self {
        unsafe {
            let pipe_set = sigpipe_set();
            let mut previous: libc::sigset_t = mem::zeroed();
            libc::pthread_sigmask(libc::SIG_BLOCK, &raw const pipe_set, &raw mut previous);
            Self {
                previous,
                was_pending: sigpipe_pending(),
            }
        }
    }
}

impl Drop for SigpipeBlock {
    fn drop(&mut self) {
        unsafe {
            if !self.was_pending && sigpipe_pending() {
                discard_sigpipe();
            }
            libc::pthread_sigmask(libc::SIG_SETMASK, &raw const self.previous, ptr::null_mut());
        }
    }
}

unsafe fn sigpipe_set() -> libc::sigset_t {
    unsafe {
        let mut set: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&raw mut set);
        libc::sigaddset(&raw mut set, libc::SIGPIPE);
        set
    }
}

unsafe fn sigpipe_pending() -> bool {
    unsafe {
        let mut pending: libc::sigset_t = mem::zeroed();
        libc::sigpending(&raw mut pending) == 0
            && libc::sigismember(&raw const pending, libc::SIGPIPE) == 1
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn discard_sigpipe() {
    unsafe {
        let set = sigpipe_set();
        let timeout = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        while libc::sigtimedwait(&raw const set, ptr::null_mut(), &raw const timeout) < 0
            && std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR)
        {}
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
unsafe fn discard_sigpipe() {
    unsafe {
        // Only called with SIGPIPE pending, so this returns at once.
        let set = sigpipe_set();
        let mut signal: c_int = 0;
        libc::sigwait(&raw const set, &raw mut signal);
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn fault_address(info: &siginfo_t) -> u64 {
    unsafe { info.si_addr() as u64 }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
unsafe fn fault_address(_info: &siginfo_t) -> u64 {
    0
}

extern "C" fn handle_fault(signal: c_int, info: *mut siginfo_t, _context: *mut c_void) {
    let (code, fault_address) = match unsafe { info.as_ref() } {
        Some(info) => (info.si_code, unsafe { fault_address(info) }),
        None => (0, 0),
    };
    let fault = FaultInfo {
        signal,
        code,
        fault_address,
    };

    let disposition = match FAULT_HOOK.get() {
        Some(hook) => hook.on_fault(&fault),
        None => FaultDisposition::ContinueDefault,
    };

    match disposition {
        FaultDisposition::ContinueDefault => unsafe { forward_to_previous(signal, code) },
    }
}

/// Reinstalls the pre-existing disposition so the fault proceeds as if never intercepted.
///
/// Kernel-generated faults re-execute the faulting instruction on return and hit the
/// restored handler. Signals sent by a process (`si_code <= 0`) are raised again; the
/// signal is blocked while we run, so delivery happens right after we return.
unsafe fn forward_to_previous(signal: c_int, code: c_int) {
    unsafe {
        match PREVIOUS_ACTION.get() {
            Some(previous) => {
                libc::sigaction(signal, previous, ptr::null_mut());
            }
            None => {
                libc::signal(signal, libc::SIG_DFL);
            }
        }
        if code <= 0 {
            libc::raise(signal);
        }
    }
}
