use super::{
    ChannelHandle, FaultDisposition, FaultHook, FaultInfo, Platform, PlatformError, SharedRegion,
};
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

/// What opening a FIFO without a reader reports on unix.
#[cfg(unix)]
const NO_LISTENER_ERRNO: i32 = libc::ENXIO;
#[cfg(not(unix))]
const NO_LISTENER_ERRNO: i32 = 6;
#[cfg(unix)]
const BAD_HANDLE_ERRNO: i32 = libc::EBADF;
#[cfg(not(unix))]
const BAD_HANDLE_ERRNO: i32 = 9;

#[derive(Debug)]
struct HeapRegion {
    id: i32,
    bytes: Arc<[AtomicU8]>,
}

impl SharedRegion for HeapRegion {
    fn id(&self) -> i32 {
        self.id
    }

    fn as_mut_ptr(&self) -> *mut u8 {
        // AtomicU8 has the layout of u8 and interior mutability.
        self.bytes.as_ptr() as *mut u8
    }

    fn len(&self) -> usize {
        self.bytes.len()
    }
}

#[derive(Default)]
struct ChannelState {
    listeners: Vec<CString>,
    opened: Vec<CString>,
    received: HashMap<CString, Vec<u8>>,
}

/// A [`Platform`] living entirely inside the current process.
///
/// Regions with the same key share storage, named channels only open once something
/// [`listen`](InMemoryPlatform::listen)s on them, and faults are delivered by calling
/// [`deliver_fault`](InMemoryPlatform::deliver_fault). Used for tests and offline trace replay;
/// none of it is signal-safe.
#[derive(Default)]
pub struct InMemoryPlatform {
    regions: Mutex<HashMap<i32, Arc<[AtomicU8]>>>,
    channels: Mutex<ChannelState>,
    fault_hook: OnceLock<&'static dyn FaultHook>,
    refuse_shared_memory: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl InMemoryPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every shared-memory attach fail, as when the fuzzer's segment is gone.
    pub fn refusing_shared_memory() -> Self {
        Self {
            refuse_shared_memory: true,
            ..Self::default()
        }
    }

    /// Starts accepting opens of the channel called `name`.
    pub fn listen(&self, name: &str) {
        if let Ok(name) = CString::new(name) {
            lock(&self.channels).listeners.push(name);
        }
    }

    /// Bytes written so far to the channel called `name`.
    pub fn received(&self, name: &str) -> Vec<u8> {
        let Ok(name) = CString::new(name) else {
            return Vec::new();
        };
        lock(&self.channels)
            .received
            .get(&name)
            .cloned()
            .unwrap_or_default()
    }

    /// How many times a channel called `name` was successfully opened.
    pub fn open_count(&self, name: &str) -> usize {
        lock(&self.channels)
            .opened
            .iter()
            .filter(|opened| opened.as_bytes() == name.as_bytes())
            .count()
    }

    /// Current contents of the region with `key`, as another attacher would see them.
    pub fn region_snapshot(&self, key: i32) -> Option<Vec<u8>> {
        lock(&self.regions)
            .get(&key)
            .map(|bytes| bytes.iter().map(|b| b.load(Ordering::Relaxed)).collect())
    }

    /// Simulates the host runtime delivering a fault. `None` if no hook is registered.
    pub fn deliver_fault(&self, info: &FaultInfo) -> Option<FaultDisposition> {
        self.fault_hook.get().map(|hook| hook.on_fault(info))
    }
}

impl fmt::Debug for InMemoryPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryPlatform")
            .field("regions", &lock(&self.regions).len())
            .field("fault_hook", &self.fault_hook.get().is_some())
            .field("refuse_shared_memory", &self.refuse_shared_memory)
            .finish()
    }
}

impl Platform for InMemoryPlatform {
    fn attach_shared_region(
        &self,
        key: i32,
        size: usize,
    ) -> Result<Box<dyn SharedRegion>, PlatformError> {
        if self.refuse_shared_memory {
            return Err(PlatformError::UnknownRegion(key));
        }
        let mut regions = lock(&self.regions);
        let bytes = regions
            .entry(key)
            .or_insert_with(|| (0..size).map(|_| AtomicU8::new(0)).collect())
            .clone();
        if bytes.len() != size {
            return Err(PlatformError::RegionSize {
                expected: size,
                actual: bytes.len(),
            });
        }
        Ok(Box::new(HeapRegion { id: key, bytes }))
    }

    fn open_notification_channel(&self, name: &CStr) -> Result<ChannelHandle, PlatformError> {
        let mut channels = lock(&self.channels);
        if !channels.listeners.iter().any(|l| l.as_c_str() == name) {
            return Err(PlatformError::Os {
                op: "open",
                errno: NO_LISTENER_ERRNO,
            });
        }
        channels.opened.push(name.to_owned());
        Ok((channels.opened.len() - 1) as ChannelHandle)
    }

    fn write_notification(&self, handle: ChannelHandle, byte: u8) -> Result<(), PlatformError> {
        let mut channels = lock(&self.channels);
        let name = usize::try_from(handle)
            .ok()
            .and_then(|index| channels.opened.get(index).cloned())
            .ok_or(PlatformError::Os {
                op: "write",
                errno: BAD_HANDLE_ERRNO,
            })?;
        channels.received.entry(name).or_default().push(byte);
        Ok(())
    }

    fn close_notification_channel(&self, _handle: ChannelHandle) {}

    fn register_fault_handler(&self, hook: &'static dyn FaultHook) -> Result<(), PlatformError> {
        self.fault_hook
            .set(hook)
            .map_err(|_| PlatformError::AlreadyRegistered)
    }
}
