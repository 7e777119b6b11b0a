use crate::platform::{Platform, PlatformError, SharedRegion};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use thiserror::Error;

/// Number of counters in the coverage map. Fixed by convention with the fuzzer.
pub const MAP_SIZE: usize = 1 << 16;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MapError {
    #[error("Shared memory id '{0}' is not an integer")]
    InvalidShmId(String),
    #[error("Failed to attach shared memory: {0}")]
    Attach(#[from] PlatformError),
    #[error("Shared region is {actual} bytes, the coverage map needs {expected}")]
    RegionTooSmall { expected: usize, actual: usize },
    #[error("Shared region {0} is not mapped")]
    Unmapped(i32),
}

enum Backing {
    Local(Box<[AtomicU8]>),
    Shared(Box<dyn SharedRegion>),
}

/// Which store a [`CoverageMap`] ended up bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapBinding {
    Local,
    Shared { id: i32 },
}

/// The edge counter table.
///
/// Counters are plain bytes that wrap on overflow. Updates use relaxed load/store pairs, so
/// concurrent increments of the same slot may lose counts; that is the accepted price for an
/// unsynchronized hot path.
pub struct CoverageMap {
    base: *const AtomicU8,
    backing: Backing,
}

// `base` points into `backing`, which is owned and never moved out.
unsafe impl Send for CoverageMap {}
unsafe impl Sync for CoverageMap {}

impl CoverageMap {
    /// A zeroed, process-owned map.
    pub fn local() -> Self {
        let counters: Box<[AtomicU8]> = (0..MAP_SIZE).map(|_| AtomicU8::new(0)).collect();
        Self {
            base: counters.as_ptr(),
            backing: Backing::Local(counters),
        }
    }

    /// Uses an attached shared region as the map. Its contents are left as the owner set them.
    pub fn from_shared(region: Box<dyn SharedRegion>) -> Result<Self, MapError> {
        if region.as_mut_ptr().is_null() {
            return Err(MapError::Unmapped(region.id()));
        }
        if region.len() < MAP_SIZE {
            return Err(MapError::RegionTooSmall {
                expected: MAP_SIZE,
                actual: region.len(),
            });
        }
        Ok(Self {
            base: region.as_mut_ptr() as *const AtomicU8,
            backing: Backing::Shared(region),
        })
    }

    /// Attaches the segment named by `shm_id`.
    pub fn attach<P: Platform + ?Sized>(platform: &P, shm_id: &str) -> Result<Self, MapError> {
        let key = shm_id
            .trim()
            .parse::<i32>()
            .map_err(|_| MapError::InvalidShmId(shm_id.to_string()))?;
        let region = platform.attach_shared_region(key, MAP_SIZE)?;
        Self::from_shared(region)
    }

    /// Binds to shared memory when an id is given, otherwise to a local map.
    ///
    /// Attach failures are logged and the local map is used instead; the run carries on.
    pub fn bind<P: Platform + ?Sized>(platform: &P, shm_id: Option<&str>) -> Self {
        let Some(shm_id) = shm_id else {
            log::info!("No shared memory id given, recording into the local coverage map");
            return Self::local();
        };
        match Self::attach(platform, shm_id) {
            Ok(map) => {
                log::info!("Coverage map bound to shared memory (key {})", shm_id.trim());
                map
            }
            Err(e) => {
                log::warn!("Falling back to the local coverage map: {e}");
                Self::local()
            }
        }
    }

    pub fn binding(&self) -> MapBinding {
        match &self.backing {
            Backing::Local(_) => MapBinding::Local,
            Backing::Shared(region) => MapBinding::Shared { id: region.id() },
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self.backing, Backing::Shared(_))
    }

    pub fn len(&self) -> usize {
        MAP_SIZE
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    #[inline]
    fn slot(&self, index: usize) -> &AtomicU8 {
        debug_assert!(index < MAP_SIZE);
        // Both backings hold at least MAP_SIZE bytes, checked at construction.
        unsafe { &*self.base.add(index % MAP_SIZE) }
    }

    /// Adds one to the counter at `index`, wrapping 255 back to 0.
    #[inline]
    pub fn increment(&self, index: usize) {
        let slot = self.slot(index);
        slot.store(slot.load(Ordering::Relaxed).wrapping_add(1), Ordering::Relaxed);
    }

    pub fn get(&self, index: usize) -> u8 {
        self.slot(index).load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> Vec<u8> {
        (0..MAP_SIZE).map(|i| self.get(i)).collect()
    }

    /// Number of slots hit at least once (modulo wraparound).
    pub fn edges_hit(&self) -> usize {
        (0..MAP_SIZE).filter(|&i| self.get(i) != 0).count()
    }

    pub fn total_hits(&self) -> u64 {
        (0..MAP_SIZE).map(|i| u64::from(self.get(i))).sum()
    }

    /// Hex md5 of the counter bytes, for cheap comparison of two runs.
    pub fn digest(&self) -> String {
        format!("{:x}", md5::compute(self.snapshot()))
    }
}

impl fmt::Debug for CoverageMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoverageMap")
            .field("binding", &self.binding())
            .field("edges_hit", &self.edges_hit())
            .finish()
    }
}
