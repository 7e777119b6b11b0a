use crate::config::BridgeConfig;
use crate::coverage_map::{CoverageMap, MapBinding};
use crate::crash::CrashInterceptor;
use crate::driver::{BranchHook, ImageInspector, Instruction, qualifies};
use crate::platform::{Platform, PlatformError};
use crate::range::{AddressRange, AddressRangeResolver};
use crate::recorder::{EdgeCoverageRecorder, EdgeRecord};
use crate::sync::{ChannelError, SyncChannel};
use serde::Serialize;
use std::sync::{Arc, OnceLock};

/// Process-wide state of the bridge.
///
/// Built once at startup, before the target runs, and shared by reference with the
/// instrumentation callback and the crash interceptor for the rest of the process.
#[derive(Debug)]
pub struct BridgeContext<P: Platform> {
    platform: Arc<P>,
    config: BridgeConfig,
    resolver: AddressRangeResolver,
    range: OnceLock<AddressRange>,
    map: CoverageMap,
    recorder: EdgeCoverageRecorder,
    channel: Arc<SyncChannel<P>>,
    interceptor: CrashInterceptor<P>,
}

impl<P: Platform> BridgeContext<P> {
    /// Reads the shared-memory id from the environment variable named in `config`.
    pub fn initialize(platform: P, config: BridgeConfig) -> Result<Self, ChannelError> {
        let shm_id = std::env::var(&config.shm_env_var).ok();
        Self::initialize_with_shm_id(platform, config, shm_id.as_deref())
    }

    pub fn initialize_with_shm_id(
        platform: P,
        config: BridgeConfig,
        shm_id: Option<&str>,
    ) -> Result<Self, ChannelError> {
        let platform = Arc::new(platform);
        let map = CoverageMap::bind(platform.as_ref(), shm_id);
        let channel = Arc::new(SyncChannel::new(
            Arc::clone(&platform),
            &config.sync_pipe,
        )?);
        let interceptor = CrashInterceptor::new(Arc::clone(&channel));
        let recorder = EdgeCoverageRecorder::new(config.boundaries(), config.debug);
        let resolver = AddressRangeResolver::new(config.code_section.clone());

        Ok(Self {
            platform,
            config,
            resolver,
            range: OnceLock::new(),
            map,
            recorder,
            channel,
            interceptor,
        })
    }

    /// Host "application started" notification. Resolves the window on the first call;
    /// later calls return the window already stored.
    pub fn on_application_start<I: ImageInspector + ?Sized>(&self, image: &I) -> AddressRange {
        *self.range.get_or_init(|| {
            let range = self.resolver.resolve(&image.sections());
            if range.is_resolved() {
                log::info!(
                    "Instrumenting {} window {:#x}..={:#x}",
                    self.resolver.code_section(),
                    range.low,
                    range.high
                );
            } else {
                log::info!(
                    "No executable {} section found, nothing will be instrumented",
                    self.resolver.code_section()
                );
            }
            range
        })
    }

    /// The resolved window, or [`AddressRange::UNSET`] before application start.
    pub fn range(&self) -> AddressRange {
        self.range.get().copied().unwrap_or(AddressRange::UNSET)
    }

    pub fn should_instrument(&self, instruction: &Instruction) -> bool {
        qualifies(instruction, &self.range())
    }

    /// Hot path: one qualifying branch at `address` is about to execute.
    #[inline]
    pub fn record_branch(&self, address: u64) -> EdgeRecord {
        self.recorder
            .record_branch(address, &self.range(), &self.map, self.channel.as_ref())
    }

    /// Hooks the crash interceptor into the platform's fault delivery.
    pub fn install_crash_interceptor(&'static self) -> Result<(), PlatformError> {
        self.interceptor.register(self.platform.as_ref())
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn map(&self) -> &CoverageMap {
        &self.map
    }

    pub fn recorder(&self) -> &EdgeCoverageRecorder {
        &self.recorder
    }

    pub fn channel(&self) -> &SyncChannel<P> {
        &self.channel
    }

    pub fn summary(&self) -> CoverageSummary {
        let range = self.range();
        CoverageSummary {
            binding: match self.map.binding() {
                MapBinding::Local => "local".to_string(),
                MapBinding::Shared { id } => format!("shared:{id}"),
            },
            range_low: range.low,
            range_high: range.high,
            edges_hit: self.map.edges_hit(),
            total_hits: self.map.total_hits(),
            map_digest: self.map.digest(),
            last_id: self.recorder.last_id(),
            recording_enabled: self.recorder.is_enabled(),
            dropped_notifications: self.channel.dropped(),
        }
    }
}

impl<P: Platform> BranchHook for BridgeContext<P> {
    #[inline]
    fn on_branch(&self, address: u64) {
        self.record_branch(address);
    }
}

/// Snapshot of a run, for humans and scripts.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct CoverageSummary {
    pub binding: String,
    pub range_low: u64,
    pub range_high: u64,
    pub edges_hit: usize,
    pub total_hits: u64,
    pub map_digest: String,
    pub last_id: u64,
    pub recording_enabled: bool,
    pub dropped_notifications: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::BranchKind;
    use crate::platform::InMemoryPlatform;
    use crate::range::Section;

    fn text_at(address: u64, size: u64) -> Vec<Section> {
        vec![
            Section::new(".plt", 0x400, 0x100, true),
            Section::new(".text", address, size, true),
        ]
    }

    fn local_context() -> BridgeContext<InMemoryPlatform> {
        BridgeContext::initialize_with_shm_id(
            InMemoryPlatform::new(),
            BridgeConfig::default(),
            None,
        )
        .unwrap()
    }

    #[test]
    fn range_is_resolved_once() {
        let ctx = local_context();
        assert_eq!(ctx.range(), AddressRange::UNSET);

        let first = ctx.on_application_start(&text_at(0x1000, 0x2000));
        assert_eq!(
            first,
            AddressRange {
                low: 0x1000,
                high: 0x3000
            }
        );
        let second = ctx.on_application_start(&text_at(0x9000, 0x10));
        assert_eq!(second, first, "The window is immutable after the first resolution");
    }

    #[test]
    fn branches_are_recorded_relative_to_window() {
        let ctx = local_context();
        ctx.on_application_start(&text_at(0x1000, 0x2000));

        assert!(ctx.should_instrument(&Instruction::new(0x1010, BranchKind::Conditional)));
        assert!(!ctx.should_instrument(&Instruction::new(0x450, BranchKind::Conditional)));

        ctx.on_branch(0x100a);
        ctx.on_branch(0x1014);
        assert_eq!(ctx.recorder().last_id(), 0x14);
        assert_eq!(ctx.map().get(0xa), 1);
        assert_eq!(ctx.map().get(0xa ^ 0x14), 1);

        let summary = ctx.summary();
        assert_eq!(summary.binding, "local");
        assert_eq!(summary.edges_hit, 2);
        assert_eq!(summary.total_hits, 2);
        assert_eq!(summary.range_low, 0x1000);
        assert!(summary.recording_enabled);
    }

    #[test]
    fn shared_binding_is_reported() {
        let ctx = BridgeContext::initialize_with_shm_id(
            InMemoryPlatform::new(),
            BridgeConfig::default(),
            Some("77"),
        )
        .unwrap();
        assert_eq!(ctx.summary().binding, "shared:77");
        ctx.on_branch(3);
        assert_eq!(ctx.platform().region_snapshot(77).unwrap()[3], 1);
    }

    #[test]
    fn exit_boundary_reaches_the_controller() {
        let platform = InMemoryPlatform::new();
        platform.listen("afl_sync");
        let config = BridgeConfig {
            exit: Some(0x20),
            ..BridgeConfig::default()
        };
        let ctx = BridgeContext::initialize_with_shm_id(platform, config, None).unwrap();
        ctx.on_application_start(&text_at(0x1000, 0x100));

        ctx.on_branch(0x1020);
        assert_eq!(ctx.platform().received("afl_sync"), vec![b'e']);
        assert!(!ctx.summary().recording_enabled);
    }
}
