use crate::context::BridgeContext;
use crate::driver::{BranchHook, Instruction};
use crate::platform::Platform;
use crate::range::{AddressRange, Section};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("Failed to read trace file {path:?}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse trace: {0}")]
    Parse(#[from] toml::de::Error),
}

/// A recorded run: the image layout plus the instructions the host saw, in execution order.
///
/// ```toml
/// [[sections]]
/// name = ".text"
/// address = 0x1000
/// size = 0x2000
///
/// [[branches]]
/// address = 0x1005
/// kind = "conditional"
/// ```
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BranchTrace {
    #[serde(default)]
    pub sections: Vec<Section>,
    #[serde(default)]
    pub branches: Vec<Instruction>,
}

impl BranchTrace {
    pub fn from_toml_str(content: &str) -> Result<Self, ReplayError> {
        Ok(toml::from_str(content)?)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ReplayError> {
        let content = std::fs::read_to_string(path).map_err(|source| ReplayError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayOutcome {
    pub range: AddressRange,
    /// Branches handed to the recorder.
    pub delivered: usize,
    /// Instructions the host would not have instrumented.
    pub filtered: usize,
}

/// Plays `trace` through `ctx` the way a live instrumentation engine would: application
/// start first, then every instruction that qualifies is delivered to the branch hook.
pub fn replay<P: Platform>(ctx: &BridgeContext<P>, trace: &BranchTrace) -> ReplayOutcome {
    let range = ctx.on_application_start(&trace.sections);
    let mut delivered = 0;
    let mut filtered = 0;
    for instruction in &trace.branches {
        if ctx.should_instrument(instruction) {
            ctx.on_branch(instruction.address);
            delivered += 1;
        } else {
            filtered += 1;
        }
    }
    log::info!("Replayed {delivered} branches ({filtered} filtered)");
    ReplayOutcome {
        range,
        delivered,
        filtered,
    }
}
