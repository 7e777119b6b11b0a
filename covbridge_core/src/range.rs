use serde::{Deserialize, Serialize};

/// A loaded section of the target image, as reported by the host's image introspection.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Section {
    pub name: String,
    pub address: u64,
    pub size: u64,
    #[serde(default = "default_executable")]
    pub executable: bool,
}

fn default_executable() -> bool {
    true
}

impl Section {
    pub fn new(name: impl Into<String>, address: u64, size: u64, executable: bool) -> Self {
        Self {
            name: name.into(),
            address,
            size,
            executable,
        }
    }
}

/// Inclusive window of application code. `0` in either bound means "not yet observed".
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddressRange {
    pub low: u64,
    pub high: u64,
}

impl AddressRange {
    pub const UNSET: AddressRange = AddressRange { low: 0, high: 0 };

    pub fn is_resolved(&self) -> bool {
        self.low != 0 || self.high != 0
    }

    /// Both bounds are inclusive. An unresolved range contains nothing.
    pub fn contains(&self, address: u64) -> bool {
        self.is_resolved() && address >= self.low && address <= self.high
    }

    /// Block id of `address` relative to the window. Wraps instead of failing.
    #[inline]
    pub fn block_id(&self, address: u64) -> u64 {
        address.wrapping_sub(self.low)
    }

    fn widen(&mut self, address: u64, size: u64) {
        let end = address.saturating_add(size);
        if self.low == 0 || address < self.low {
            self.low = address;
        }
        if self.high == 0 || end > self.high {
            self.high = end;
        }
    }
}

/// Computes the instrumentation window from the executable sections of the target image.
///
/// Only executable sections named after the primary code section count as application
/// code. Loader stubs such as `.plt`, `.init` and `.fini` are left out even though they are
/// executable. The result is a min/max reduction, so section order does not matter.
#[derive(Debug, Clone)]
pub struct AddressRangeResolver {
    code_section: String,
}

impl AddressRangeResolver {
    pub fn new(code_section: impl Into<String>) -> Self {
        Self {
            code_section: code_section.into(),
        }
    }

    pub fn code_section(&self) -> &str {
        &self.code_section
    }

    pub fn matches(&self, section: &Section) -> bool {
        section.executable && section.address != 0 && section.name == self.code_section
    }

    pub fn resolve<'a, I>(&self, sections: I) -> AddressRange
    where
        I: IntoIterator<Item = &'a Section>,
    {
        let mut range = AddressRange::UNSET;
        for section in sections.into_iter().filter(|s| self.matches(s)) {
            log::debug!(
                "Code section {} at {:#x}, size {:#x}",
                section.name,
                section.address,
                section.size
            );
            range.widen(section.address, section.size);
        }
        range
    }
}

impl Default for AddressRangeResolver {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_CODE_SECTION)
    }
}
