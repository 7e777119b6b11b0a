//! The surface the host instrumentation engine talks to.
//!
//! Basic-block discovery and code insertion belong to the host. It asks
//! [`qualifies`] which instructions get a callback and then calls
//! [`BranchHook::on_branch`] right before each of them executes.

use crate::range::{AddressRange, Section};
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BranchKind {
    /// Conditional branch; has a fall-through successor.
    Conditional,
    Call,
    /// Unconditional jump.
    Jump,
    Return,
    /// Not a control-flow instruction.
    Other,
}

impl BranchKind {
    pub fn is_branch(self) -> bool {
        !matches!(self, BranchKind::Other)
    }

    pub fn has_fall_through(self) -> bool {
        matches!(self, BranchKind::Conditional | BranchKind::Other)
    }

    pub fn is_call(self) -> bool {
        matches!(self, BranchKind::Call)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Instruction {
    pub address: u64,
    pub kind: BranchKind,
}

impl Instruction {
    pub fn new(address: u64, kind: BranchKind) -> Self {
        Self { address, kind }
    }
}

/// Whether the host should insert the recording callback before `instruction`.
///
/// Only branches inside the window that either fall through or call, like afl-as does:
/// plain jumps and returns add no new edge information.
pub fn qualifies(instruction: &Instruction, range: &AddressRange) -> bool {
    range.contains(instruction.address)
        && instruction.kind.is_branch()
        && (instruction.kind.has_fall_through() || instruction.kind.is_call())
}

/// Host image introspection.
pub trait ImageInspector {
    /// Every section of the main executable image.
    fn sections(&self) -> Vec<Section>;
}

impl ImageInspector for [Section] {
    fn sections(&self) -> Vec<Section> {
        self.to_vec()
    }
}

impl ImageInspector for Vec<Section> {
    fn sections(&self) -> Vec<Section> {
        self.clone()
    }
}

/// Callback the host invokes before every qualifying branch.
///
/// Runs on the target's own threads on every instrumented edge; implementations must not
/// allocate, block or fail.
pub trait BranchHook: Sync {
    fn on_branch(&self, address: u64);
}
