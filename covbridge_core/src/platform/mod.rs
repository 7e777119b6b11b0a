//! Platform capabilities the bridge needs from the operating system.
//!
//! The resolver and recorder never talk to the OS directly. Shared-memory attach, the
//! notification FIFO and fault-handler registration all go through [`Platform`], with the
//! implementation picked at build time.

use std::ffi::CStr;
use std::fmt::Debug;
use thiserror::Error;

pub mod memory;
#[cfg(unix)]
pub mod unix;

pub use memory::InMemoryPlatform;
#[cfg(unix)]
pub use unix::UnixPlatform;

/// Raw handle of an opened notification channel. Negative values mean "not open".
pub type ChannelHandle = i64;

/// Sentinel for a channel that has not been opened.
pub const NO_CHANNEL: ChannelHandle = -1;

/// Errors reported by platform primitives.
///
/// Only static strings and an errno are carried, so these can be produced from signal
/// context without allocating.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformError {
    #[error("{op} failed with errno {errno}")]
    Os { op: &'static str, errno: i32 },
    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
    #[error("Shared region has {actual} bytes, expected {expected}")]
    RegionSize { expected: usize, actual: usize },
    #[error("No shared region with id {0}")]
    UnknownRegion(i32),
    #[error("Fault handler already registered")]
    AlreadyRegistered,
}

impl PlatformError {
    pub fn last_os_error(op: &'static str) -> Self {
        PlatformError::Os {
            op,
            errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
        }
    }
}

/// A memory region shared with another process.
///
/// The region stays mapped for as long as the value lives.
pub trait SharedRegion: Send + Sync + Debug {
    /// Identifier other processes use to attach the same region.
    fn id(&self) -> i32;
    /// Base of the mapping. Valid for `len()` bytes while `self` is alive.
    fn as_mut_ptr(&self) -> *mut u8;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What the host runtime should do after a fault hook ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultDisposition {
    /// Continue with the fault handling that would have happened without interception.
    ContinueDefault,
}

/// Fault metadata handed to a [`FaultHook`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultInfo {
    pub signal: i32,
    pub code: i32,
    pub fault_address: u64,
}

/// Callback run on fatal faults.
///
/// Runs in signal context: implementations must not allocate, lock, log or block.
pub trait FaultHook: Send + Sync {
    fn on_fault(&self, info: &FaultInfo) -> FaultDisposition;
}

/// OS services used by the bridge.
pub trait Platform: Send + Sync + 'static {
    /// Gets or creates the segment identified by `key` and maps exactly `size` bytes of it.
    fn attach_shared_region(
        &self,
        key: i32,
        size: usize,
    ) -> Result<Box<dyn SharedRegion>, PlatformError>;

    /// Opens the write end of the named notification channel.
    fn open_notification_channel(&self, name: &CStr) -> Result<ChannelHandle, PlatformError>;

    /// Writes one byte. Must be async-signal-safe.
    fn write_notification(&self, handle: ChannelHandle, byte: u8) -> Result<(), PlatformError>;

    fn close_notification_channel(&self, handle: ChannelHandle);

    /// Installs `hook` for segmentation faults. Registration happens at most once per process.
    fn register_fault_handler(&self, hook: &'static dyn FaultHook) -> Result<(), PlatformError>;
}
