pub mod config;
pub mod context;
pub mod coverage_map;
pub mod crash;
pub mod driver;
pub mod platform;
pub mod range;
pub mod recorder;
pub mod replay;
pub mod sync;

pub use config::{BridgeConfig, ConfigError, parse_block_id};
pub use context::{BridgeContext, CoverageSummary};
pub use coverage_map::{CoverageMap, MAP_SIZE, MapBinding, MapError};
pub use crash::CrashInterceptor;
pub use driver::{BranchHook, BranchKind, ImageInspector, Instruction, qualifies};
pub use platform::{
    FaultDisposition, FaultHook, FaultInfo, InMemoryPlatform, Platform, PlatformError,
};
#[cfg(unix)]
pub use platform::UnixPlatform;
pub use range::{AddressRange, AddressRangeResolver, Section};
pub use recorder::{BoundaryConfig, EdgeCoverageRecorder, EdgeRecord, Transition, edge_index};
pub use replay::{BranchTrace, ReplayError, ReplayOutcome, replay};
pub use sync::{ChannelError, EventSink, SyncChannel, SyncEvent};
