use crate::platform::{ChannelHandle, NO_CHANNEL, Platform, PlatformError};
use std::ffi::CString;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use thiserror::Error;

/// Events relayed to the controller. The discriminant is the byte on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SyncEvent {
    /// Execution reached the configured exit block.
    ExitBoundary = b'e',
    /// The target took a fatal fault.
    Crash = b'c',
}

impl SyncEvent {
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'e' => Some(SyncEvent::ExitBoundary),
            b'c' => Some(SyncEvent::Crash),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SyncEvent::ExitBoundary => "exit-boundary",
            SyncEvent::Crash => "crash",
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Channel name {0:?} contains a NUL byte")]
    InvalidName(String),
    #[error("Could not open notification channel: {0}")]
    Open(PlatformError),
    #[error("Could not write to notification channel: {0}")]
    Write(PlatformError),
}

/// Anything that accepts outbound events. The recorder only needs this much.
pub trait EventSink {
    fn notify(&self, event: SyncEvent);
}

/// One-way byte channel to the controller process.
///
/// The endpoint is opened on first send and the handle kept for the rest of the process.
/// A failed open is not fatal: the byte is dropped, the drop is counted, and the next send
/// tries to open again. Concurrent first sends race to open; exactly one handle wins and the
/// others are closed again.
pub struct SyncChannel<P: Platform> {
    platform: Arc<P>,
    name: CString,
    handle: AtomicI64,
    dropped: AtomicU64,
    drop_reported: AtomicBool,
}

impl<P: Platform> SyncChannel<P> {
    pub fn new(platform: Arc<P>, name: &Path) -> Result<Self, ChannelError> {
        let display = name.to_string_lossy().into_owned();
        let name = CString::new(display.as_bytes())
            .map_err(|_| ChannelError::InvalidName(display.clone()))?;
        Ok(Self {
            platform,
            name,
            handle: AtomicI64::new(NO_CHANNEL),
            dropped: AtomicU64::new(0),
            drop_reported: AtomicBool::new(false),
        })
    }

    pub fn is_open(&self) -> bool {
        self.handle.load(Ordering::Acquire) >= 0
    }

    /// Bytes that could not be delivered so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn ensure_open(&self) -> Result<ChannelHandle, ChannelError> {
        let current = self.handle.load(Ordering::Acquire);
        if current >= 0 {
            return Ok(current);
        }
        let opened = self
            .platform
            .open_notification_channel(&self.name)
            .map_err(ChannelError::Open)?;
        match self
            .handle
            .compare_exchange(NO_CHANNEL, opened, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(opened),
            Err(winner) => {
                self.platform.close_notification_channel(opened);
                Ok(winner)
            }
        }
    }

    fn try_send(&self, event: SyncEvent) -> Result<(), ChannelError> {
        let handle = self.ensure_open()?;
        self.platform
            .write_notification(handle, event.as_byte())
            .map_err(ChannelError::Write)
    }

    /// Sends one event byte. Failures are counted, logged once, and returned.
    pub fn send(&self, event: SyncEvent) -> Result<(), ChannelError> {
        let result = self.try_send(event);
        if let Err(e) = &result {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            if !self.drop_reported.swap(true, Ordering::Relaxed) {
                log::warn!(
                    "Dropping {} notification for {:?}: {e}",
                    event.name(),
                    self.name
                );
            } else {
                log::debug!("Dropping {} notification: {e}", event.name());
            }
        }
        result
    }

    /// Sends one event byte from signal context.
    ///
    /// Only atomics and the platform's open/write primitives are touched. Returns whether the
    /// byte was written.
    pub fn send_signal_safe(&self, event: SyncEvent) -> bool {
        match self.try_send(event) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

impl<P: Platform> EventSink for SyncChannel<P> {
    fn notify(&self, event: SyncEvent) {
        let _ = self.send(event);
    }
}

impl<P: Platform> Drop for SyncChannel<P> {
    fn drop(&mut self) {
        let handle = self.handle.swap(NO_CHANNEL, Ordering::AcqRel);
        if handle >= 0 {
            self.platform.close_notification_channel(handle);
        }
    }
}

impl<P: Platform> fmt::Debug for SyncChannel<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncChannel")
            .field("name", &self.name)
            .field("open", &self.is_open())
            .field("dropped", &self.dropped())
            .finish()
    }
}
