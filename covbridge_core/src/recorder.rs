use crate::coverage_map::{CoverageMap, MAP_SIZE};
use crate::range::AddressRange;
use crate::sync::{EventSink, SyncEvent};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Slot of the edge `prev_id -> cur_id`.
///
/// Must match the fuzzer's convention exactly: `(cur_id XOR prev_id) mod 65536`.
#[inline]
pub fn edge_index(prev_id: u64, cur_id: u64) -> usize {
    ((cur_id ^ prev_id) % MAP_SIZE as u64) as usize
}

/// Block ids at which recording is switched on (`entry`) and off (`exit`).
///
/// An id of 0 is the "unset" value, so a boundary on the very first byte of the window
/// cannot be expressed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BoundaryConfig {
    entry: Option<u64>,
    exit: Option<u64>,
}

impl BoundaryConfig {
    pub fn new(entry: Option<u64>, exit: Option<u64>) -> Self {
        Self {
            entry: entry.filter(|&id| id != 0),
            exit: exit.filter(|&id| id != 0),
        }
    }

    pub fn entry(&self) -> Option<u64> {
        self.entry
    }

    pub fn exit(&self) -> Option<u64> {
        self.exit
    }
}

/// What a single [`EdgeCoverageRecorder::record`] call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeRecord {
    pub cur_id: u64,
    pub index: usize,
    pub counted: bool,
    pub transition: Transition,
}

/// Gate change caused by reaching a boundary block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    None,
    Entered,
    Exited,
}

/// Per-branch edge recording.
///
/// State is kept in relaxed atomics with no locking: when several target threads run
/// instrumented code at once, `last_id` interleaves across threads and counts can be lost.
pub struct EdgeCoverageRecorder {
    last_id: AtomicU64,
    enabled: AtomicBool,
    boundaries: BoundaryConfig,
    debug: bool,
}

impl EdgeCoverageRecorder {
    pub fn new(boundaries: BoundaryConfig, debug: bool) -> Self {
        Self {
            last_id: AtomicU64::new(0),
            enabled: AtomicBool::new(true),
            boundaries,
            debug,
        }
    }

    pub fn last_id(&self) -> u64 {
        self.last_id.load(Ordering::Relaxed)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn boundaries(&self) -> BoundaryConfig {
        self.boundaries
    }

    /// Records the branch at block id `cur_id` (address minus window low).
    ///
    /// The predecessor id always advances, even while the gate is closed, so that counting
    /// resumes against the true previous block once the gate reopens.
    #[inline]
    pub fn record<S: EventSink + ?Sized>(
        &self,
        cur_id: u64,
        map: &CoverageMap,
        sink: &S,
    ) -> EdgeRecord {
        let prev_id = self.last_id.load(Ordering::Relaxed);
        let index = edge_index(prev_id, cur_id);
        let counted = self.enabled.load(Ordering::Relaxed);
        if counted {
            map.increment(index);
        }
        self.last_id.store(cur_id, Ordering::Relaxed);

        let transition = if self.boundaries.entry == Some(cur_id) {
            self.enabled.store(true, Ordering::Relaxed);
            log::debug!("Entry block {cur_id:#x} reached, recording enabled");
            Transition::Entered
        } else if self.boundaries.exit == Some(cur_id) {
            self.enabled.store(false, Ordering::Relaxed);
            log::debug!("Exit block {cur_id:#x} reached, recording disabled");
            sink.notify(SyncEvent::ExitBoundary);
            Transition::Exited
        } else {
            Transition::None
        };

        EdgeRecord {
            cur_id,
            index,
            counted,
            transition,
        }
    }

    /// Like [`record`](Self::record), with the per-edge trace when debug mode is on.
    #[inline]
    pub fn record_branch<S: EventSink + ?Sized>(
        &self,
        cur_addr: u64,
        window: &AddressRange,
        map: &CoverageMap,
        sink: &S,
    ) -> EdgeRecord {
        let record = self.record(window.block_id(cur_addr), map, sink);
        if self.debug {
            log::debug!(
                target: "covbridge::edge",
                "addr={cur_addr:#x} rel={:#x} index={}{}",
                record.cur_id,
                record.index,
                if record.counted { "" } else { " (gated)" }
            );
        }
        record
    }
}

impl std::fmt::Debug for EdgeCoverageRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdgeCoverageRecorder")
            .field("last_id", &self.last_id())
            .field("enabled", &self.is_enabled())
            .field("boundaries", &self.boundaries)
            .field("debug", &self.debug)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct CapturingSink {
        events: RefCell<Vec<SyncEvent>>,
    }

    impl EventSink for CapturingSink {
        fn notify(&self, event: SyncEvent) {
            self.events.borrow_mut().push(event);
        }
    }

    #[test]
    fn edge_index_is_xor_modulo_map_size() {
        assert_eq!(edge_index(10, 10), 0);
        assert_eq!(edge_index(10, 20), 30);
        assert_eq!(edge_index(0, 0x1_0005), 5, "Ids wrap into the map");
        assert_eq!(edge_index(0xffff_0000, 0xffff_00ff), 0xff);
        for (prev, cur) in [(1u64, 2u64), (0x1234, 0x9876), (u64::MAX, 3)] {
            assert_eq!(edge_index(prev, cur), edge_index(prev, cur));
            assert!(edge_index(prev, cur) < MAP_SIZE);
        }
    }

    #[test]
    fn consecutive_ids_hash_transitions() {
        let recorder = EdgeCoverageRecorder::new(BoundaryConfig::default(), false);
        let map = CoverageMap::local();
        let sink = CapturingSink::default();

        recorder.last_id.store(10, Ordering::Relaxed);
        assert_eq!(recorder.record(10, &map, &sink).index, 0);
        assert_eq!(recorder.record(20, &map, &sink).index, 30);
        assert_eq!(map.get(0), 1);
        assert_eq!(map.get(30), 1);
        assert_eq!(map.total_hits(), 2);
    }

    #[test]
    fn exit_then_gated_edge_still_advances_last_id() {
        let recorder = EdgeCoverageRecorder::new(BoundaryConfig::new(Some(0), Some(0x50)), false);
        let map = CoverageMap::local();
        let sink = CapturingSink::default();

        let first = recorder.record(5, &map, &sink);
        assert!(first.counted);
        assert_eq!(first.transition, Transition::None);
        assert_eq!(map.get(edge_index(0, 5)), 1);

        let exit = recorder.record(0x50, &map, &sink);
        assert!(exit.counted, "The exit block's own edge is still counted");
        assert_eq!(exit.transition, Transition::Exited);
        assert!(!recorder.is_enabled());
        assert_eq!(map.get(edge_index(5, 0x50)), 1);

        let gated = recorder.record(5, &map, &sink);
        assert!(!gated.counted, "Edges after exit must not be counted");
        assert_eq!(
            map.get(edge_index(0x50, 5)),
            1,
            "0x50->5 shares its slot with 5->0x50, which stays at one hit"
        );
        assert_eq!(recorder.last_id(), 5, "last_id keeps moving while gated");

        assert_eq!(*sink.events.borrow(), vec![SyncEvent::ExitBoundary]);
        assert_eq!(map.total_hits(), 2);
    }

    #[test]
    fn boundaries_are_retriggerable() {
        let recorder =
            EdgeCoverageRecorder::new(BoundaryConfig::new(Some(0x10), Some(0x20)), false);
        let map = CoverageMap::local();
        let sink = CapturingSink::default();

        recorder.record(0x20, &map, &sink);
        recorder.record(0x20, &map, &sink);
        assert_eq!(sink.events.borrow().len(), 2, "Exit fires every time it is reached");
        assert!(!recorder.is_enabled());

        let reentry = recorder.record(0x10, &map, &sink);
        assert_eq!(reentry.transition, Transition::Entered);
        assert!(!reentry.counted, "The entry edge itself is seen with the gate still closed");
        assert!(recorder.is_enabled());

        let hits_before = map.total_hits();
        let after = recorder.record(0x31, &map, &sink);
        assert!(after.counted, "Edges after re-entry are counted");
        assert_eq!(map.get(edge_index(0x10, 0x31)), 1);
        assert_eq!(map.total_hits(), hits_before + 1);
    }

    #[test]
    fn entry_while_enabled_is_idempotent() {
        let recorder = EdgeCoverageRecorder::new(BoundaryConfig::new(Some(4), None), false);
        let map = CoverageMap::local();
        let sink = CapturingSink::default();
        assert_eq!(recorder.record(4, &map, &sink).transition, Transition::Entered);
        assert!(recorder.is_enabled());
        assert!(sink.events.borrow().is_empty());
    }

    #[test]
    fn entry_wins_when_entry_equals_exit() {
        let recorder = EdgeCoverageRecorder::new(BoundaryConfig::new(Some(8), Some(8)), false);
        let map = CoverageMap::local();
        let sink = CapturingSink::default();
        assert_eq!(recorder.record(8, &map, &sink).transition, Transition::Entered);
        assert!(recorder.is_enabled());
        assert!(sink.events.borrow().is_empty());
    }

    #[test]
    fn record_branch_is_relative_to_window_and_never_fails() {
        let recorder = EdgeCoverageRecorder::new(BoundaryConfig::default(), true);
        let map = CoverageMap::local();
        let sink = CapturingSink::default();

        let window = AddressRange {
            low: 0x1000,
            high: 0x3000,
        };

        let rec = recorder.record_branch(0x1005, &window, &map, &sink);
        assert_eq!(rec.cur_id, 5);
        assert_eq!(recorder.last_id(), 5);

        let below = recorder.record_branch(0x10, &window, &map, &sink);
        assert_eq!(below.cur_id, 0x10u64.wrapping_sub(0x1000));
        assert!(below.index < MAP_SIZE);
    }

    #[test]
    fn debug_mode_only_adds_tracing() {
        let boundaries = BoundaryConfig::new(Some(0x30), Some(0x50));
        let window = AddressRange {
            low: 0x1000,
            high: 0x3000,
        };
        let quiet = EdgeCoverageRecorder::new(boundaries, false);
        let traced = EdgeCoverageRecorder::new(boundaries, true);
        let quiet_map = CoverageMap::local();
        let traced_map = CoverageMap::local();
        let quiet_sink = CapturingSink::default();
        let traced_sink = CapturingSink::default();

        for addr in [0x1005, 0x1010, 0x1050, 0x1010, 0x1030, 0x1007, 0x1005, 0x1050, 0x1020] {
            let a = quiet.record_branch(addr, &window, &quiet_map, &quiet_sink);
            let b = traced.record_branch(addr, &window, &traced_map, &traced_sink);
            assert_eq!(a, b, "Same record for {addr:#x}");
        }

        assert_eq!(quiet_map.snapshot(), traced_map.snapshot());
        assert_eq!(quiet.last_id(), traced.last_id());
        assert_eq!(quiet.is_enabled(), traced.is_enabled());
        assert!(!traced.is_enabled(), "Sequence ends behind the exit block");
        assert_eq!(*quiet_sink.events.borrow(), *traced_sink.events.borrow());
    }
}
