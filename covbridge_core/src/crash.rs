use crate::platform::{FaultDisposition, FaultHook, FaultInfo, Platform, PlatformError};
use crate::sync::{SyncChannel, SyncEvent};
use std::sync::Arc;

/// Reports fatal faults to the controller.
///
/// On a fault it writes a single `'c'` to the sync channel and hands the fault back to the
/// host's normal handling; the crash itself is never suppressed. Runs in signal context, so
/// it does nothing but the signal-safe send.
#[derive(Debug)]
pub struct CrashInterceptor<P: Platform> {
    channel: Arc<SyncChannel<P>>,
}

impl<P: Platform> CrashInterceptor<P> {
    pub fn new(channel: Arc<SyncChannel<P>>) -> Self {
        Self { channel }
    }

    /// Registers with the platform. Call once, before the target starts executing.
    pub fn register(&'static self, platform: &P) -> Result<(), PlatformError> {
        platform.register_fault_handler(self)
    }
}

impl<P: Platform> FaultHook for CrashInterceptor<P> {
    fn on_fault(&self, _info: &FaultInfo) -> FaultDisposition {
        self.channel.send_signal_safe(SyncEvent::Crash);
        FaultDisposition::ContinueDefault
    }
}
