use covbridge_core::{
    AddressRange, BranchHook, BridgeConfig, BridgeContext, InMemoryPlatform, MAP_SIZE, Section,
    edge_index,
};

fn context_with(
    config: BridgeConfig,
    platform: InMemoryPlatform,
) -> BridgeContext<InMemoryPlatform> {
    BridgeContext::initialize_with_shm_id(platform, config, None).unwrap()
}

#[test]
fn text_section_resolves_to_inclusive_window() {
    let ctx = context_with(BridgeConfig::default(), InMemoryPlatform::new());
    let range = ctx.on_application_start(&vec![Section::new(".text", 0x1000, 0x2000, true)]);
    assert_eq!(
        range,
        AddressRange {
            low: 0x1000,
            high: 0x3000
        }
    );
}

#[test]
fn exit_boundary_gates_later_edges_but_not_last_id() {
    let platform = InMemoryPlatform::new();
    platform.listen("afl_sync");
    let config = BridgeConfig::from_toml_str("entry = 0\nexit = \"0x50\"").unwrap();
    let ctx = context_with(config, platform);
    ctx.on_application_start(&vec![Section::new(".text", 0x1000, 0x2000, true)]);

    ctx.on_branch(0x1005);
    assert!(ctx.recorder().is_enabled());
    assert_eq!(ctx.map().total_hits(), 1, "Id 5 is counted");

    ctx.on_branch(0x1050);
    assert!(!ctx.recorder().is_enabled(), "Gate flips at the exit id");
    assert_eq!(ctx.map().total_hits(), 2);
    assert_eq!(ctx.platform().received("afl_sync"), b"e".to_vec());

    ctx.on_branch(0x1005);
    assert_eq!(ctx.map().total_hits(), 2, "Id 5 after exit is not counted");
    assert_eq!(ctx.recorder().last_id(), 5);
    assert_eq!(
        ctx.platform().received("afl_sync"),
        b"e".to_vec(),
        "Exit notification was sent exactly once"
    );
}

#[test]
fn exit_reached_twice_notifies_twice_and_entry_reopens() {
    let platform = InMemoryPlatform::new();
    platform.listen("afl_sync");
    let config = BridgeConfig::from_toml_str("entry = \"0x10\"\nexit = \"0x80\"").unwrap();
    let ctx = context_with(config, platform);
    ctx.on_application_start(&vec![Section::new(".text", 0x4000, 0x1000, true)]);

    for addr in [0x4080, 0x4003, 0x4080] {
        ctx.on_branch(addr);
    }
    assert_eq!(ctx.platform().received("afl_sync"), b"ee".to_vec());
    let hits = ctx.map().total_hits();

    ctx.on_branch(0x4010);
    ctx.on_branch(0x4022);
    assert!(ctx.recorder().is_enabled());
    assert_eq!(ctx.map().total_hits(), hits + 1);
    assert_eq!(ctx.map().get(edge_index(0x10, 0x22)), 1);
}

#[test]
fn xor_of_consecutive_ids_selects_the_slot() {
    let ctx = context_with(BridgeConfig::default(), InMemoryPlatform::new());
    ctx.on_application_start(&vec![Section::new(".text", 0x1000, 0x100, true)]);

    ctx.on_branch(0x100a);
    let before = ctx.map().get(0);
    let first = ctx.record_branch(0x100a);
    assert_eq!(first.index, 0, "(10 XOR 10) mod 65536");
    assert_eq!(ctx.map().get(0), before + 1);

    let second = ctx.record_branch(0x1014);
    assert_eq!(second.index, 30, "(20 XOR 10) mod 65536");
    assert!(second.index < MAP_SIZE);
}

#[test]
fn run_without_shared_memory_stays_in_process() {
    let platform = InMemoryPlatform::new();
    let ctx = context_with(BridgeConfig::default(), platform);
    ctx.on_application_start(&vec![Section::new(".text", 0x1000, 0x2000, true)]);

    for addr in [0x1000, 0x1100, 0x1200, 0x1100, 0x2fff] {
        ctx.on_branch(addr);
    }

    let summary = ctx.summary();
    assert_eq!(summary.binding, "local");
    assert!(summary.edges_hit > 0);
    assert_eq!(summary.dropped_notifications, 0);
    assert_eq!(
        ctx.platform().open_count("afl_sync"),
        0,
        "No boundary configured, so the channel is never touched"
    );
}

#[test]
fn shared_counters_are_visible_to_the_fuzzer_side() {
    let platform = InMemoryPlatform::new();
    let ctx =
        BridgeContext::initialize_with_shm_id(platform, BridgeConfig::default(), Some("31337"))
            .unwrap();
    ctx.on_application_start(&vec![Section::new(".text", 0x1000, 0x2000, true)]);
    ctx.on_branch(0x1001);
    ctx.on_branch(0x1002);

    let fuzzer_view = ctx.platform().region_snapshot(31337).unwrap();
    assert_eq!(fuzzer_view.len(), MAP_SIZE);
    assert_eq!(fuzzer_view[1], 1);
    assert_eq!(fuzzer_view[1 ^ 2], 1);
    assert_eq!(fuzzer_view, ctx.map().snapshot());
}

#[test]
fn missing_text_section_records_nothing_useful_but_never_fails() {
    let ctx = context_with(BridgeConfig::default(), InMemoryPlatform::new());
    let range = ctx.on_application_start(&vec![Section::new(".plt", 0x1000, 0x10, true)]);
    assert!(!range.is_resolved());
    assert!(!ctx.should_instrument(&covbridge_core::Instruction::new(
        0x1000,
        covbridge_core::BranchKind::Call
    )));
}
