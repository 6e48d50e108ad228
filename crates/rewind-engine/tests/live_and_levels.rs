//! Playing a stream while it is still being recorded, and streams that
//! span more than one level.

use std::sync::Arc;
use std::time::Duration;

use rewind_core::{FieldValue, LevelIndex, Simulation};
use rewind_engine::{PlaybackState, Session, SessionConfig, SessionEvent};
use rewind_replay::MemoryStore;
use rewind_test_utils::fixtures::{arena_world, PAWN};
use rewind_test_utils::{ManualClock, MockWorld};

// ── Helpers ─────────────────────────────────────────────────────

const STREAM: &str = "live";

fn config() -> SessionConfig {
    let mut config = SessionConfig::default();
    config.record.max_record_hz = 10.0;
    config.checkpoint.interval_secs = 1.0;
    config.playback.live_edge_buffer_ms = 1000;
    config
}

struct Live {
    store: MemoryStore,
    world: MockWorld,
    session: Session<MemoryStore>,
    ticks: i64,
}

impl Live {
    fn start() -> Self {
        let store = MemoryStore::new();
        let world = arena_world();
        let mut session = Session::new(store.clone(), config()).unwrap();
        session.record(STREAM, &world).unwrap();
        Self {
            store,
            world,
            session,
            ticks: 0,
        }
    }

    /// Record `n` more ticks, writing the tick index into the counter.
    fn advance(&mut self, n: i64) {
        let counter = self.world.find_persistent("Arena.Counter").unwrap();
        for _ in 0..n {
            self.world.set(counter, "value", FieldValue::Int(self.ticks));
            self.session.tick(&mut self.world, 0.1).unwrap();
            self.ticks += 1;
        }
    }
}

fn counter(world: &MockWorld, level: &str) -> Option<FieldValue> {
    world.get_path(&format!("{level}.Counter"), "value")
}

// ── Live streams ────────────────────────────────────────────────

#[test]
fn live_playback_waits_for_new_frames() {
    let mut live = Live::start();
    live.advance(10);

    let mut world = arena_world();
    let mut viewer = Session::new(live.store.clone(), config()).unwrap();
    viewer.play(STREAM, &world).unwrap();
    viewer.tick(&mut world, 0.0).unwrap();
    for _ in 0..15 {
        viewer.tick(&mut world, 0.1).unwrap();
    }
    assert_eq!(counter(&world, "Arena"), Some(FieldValue::Int(9)));
    assert_eq!(
        viewer.player().map(|p| p.state()),
        Some(PlaybackState::Streaming)
    );

    live.advance(10);
    for _ in 0..5 {
        viewer.tick(&mut world, 0.1).unwrap();
    }
    assert_eq!(counter(&world, "Arena"), Some(FieldValue::Int(19)));
    assert!(!viewer.drain_events().contains(&SessionEvent::EndOfStream));
}

#[test]
fn jump_to_live_waits_for_the_edge_to_move() {
    let mut live = Live::start();
    live.advance(50);

    let mut world = arena_world();
    let mut viewer = Session::new(live.store.clone(), config()).unwrap();
    viewer.play(STREAM, &world).unwrap();
    viewer.jump_to_live().unwrap();
    viewer.tick(&mut world, 0.1).unwrap();
    viewer.tick(&mut world, 0.1).unwrap();
    assert!(viewer.player().unwrap().is_busy());

    live.advance(1);
    for _ in 0..3 {
        viewer.tick(&mut world, 0.0).unwrap();
    }
    assert_eq!(viewer.current_time(), 4.0);
    assert_eq!(counter(&world, "Arena"), Some(FieldValue::Int(40)));
    assert!(viewer.drain_events().contains(&SessionEvent::GotoFinished {
        success: true,
        time: 4.0
    }));
}

#[test]
fn jump_to_live_gives_up_waiting_after_timeout() {
    let mut live = Live::start();
    live.advance(30);

    let clock = ManualClock::new();
    let mut world = arena_world();
    let mut viewer =
        Session::with_clock(live.store.clone(), config(), Arc::new(clock.clone())).unwrap();
    viewer.play(STREAM, &world).unwrap();
    viewer.jump_to_live().unwrap();
    viewer.tick(&mut world, 0.1).unwrap();

    clock.advance(Duration::from_secs(16));
    for _ in 0..3 {
        viewer.tick(&mut world, 0.0).unwrap();
    }
    // 2.9s recorded, minus the one-second buffer.
    assert_eq!(viewer.current_time(), 1.9);
}

#[test]
fn jump_to_live_on_a_finished_stream_is_a_no_op() {
    let mut live = Live::start();
    live.advance(10);
    live.session.stop().unwrap();

    let mut world = arena_world();
    let mut viewer = Session::new(live.store.clone(), config()).unwrap();
    viewer.play(STREAM, &world).unwrap();
    viewer.jump_to_live().unwrap();
    viewer.tick(&mut world, 0.1).unwrap();
    assert!(!viewer.player().unwrap().is_busy());
    assert_eq!(viewer.current_time(), 0.0);
}

#[test]
fn skip_past_published_frames_waits_for_the_recorder() {
    let mut live = Live::start();
    live.advance(10);
    live.store.extend_total_duration_ms(STREAM, 2000);

    let mut world = arena_world();
    let mut viewer = Session::new(live.store.clone(), config()).unwrap();
    viewer.play(STREAM, &world).unwrap();
    viewer.tick(&mut world, 0.0).unwrap();
    viewer.skip(1.5).unwrap();
    viewer.tick(&mut world, 0.0).unwrap();
    assert!(viewer.player().unwrap().is_busy());
    assert_eq!(viewer.current_time(), 0.0);
    assert_eq!(counter(&world, "Arena"), Some(FieldValue::Int(9)));

    live.advance(10);
    viewer.tick(&mut world, 0.0).unwrap();
    assert!(!viewer.player().unwrap().is_busy());
    assert_eq!(viewer.current_time(), 1.5);
    assert_eq!(counter(&world, "Arena"), Some(FieldValue::Int(15)));
}

// ── Levels ──────────────────────────────────────────────────────

/// Two seconds in `Arena`, then two seconds in `Bridge`.
fn record_two_levels(store: &MemoryStore) {
    let mut world = arena_world();
    let mut session = Session::new(store.clone(), config()).unwrap();
    session.record(STREAM, &world).unwrap();
    for i in 0..20 {
        let counter = world.find_persistent("Arena.Counter").unwrap();
        world.set(counter, "value", FieldValue::Int(i));
        session.tick(&mut world, 0.1).unwrap();
    }

    let recorder = session.recorder_mut().unwrap();
    recorder.begin_level_transition("Bridge").unwrap();
    world.load_level("Bridge").unwrap();
    recorder.finish_level_transition(&world).unwrap();

    for i in 0..20 {
        let counter = world.find_persistent("Bridge.Counter").unwrap();
        world.set(counter, "value", FieldValue::Int(100 + i));
        session.tick(&mut world, 0.1).unwrap();
    }
    session.stop().unwrap();
}

#[test]
fn playback_follows_level_changes() {
    let store = MemoryStore::new();
    record_two_levels(&store);
    let mut world = arena_world();
    let mut session = Session::new(store.clone(), config()).unwrap();
    session.play(STREAM, &world).unwrap();
    session.tick(&mut world, 0.0).unwrap();
    for _ in 0..45 {
        session.tick(&mut world, 0.1).unwrap();
    }

    assert_eq!(world.current_level(), "Bridge");
    assert_eq!(counter(&world, "Bridge"), Some(FieldValue::Int(119)));
    assert!(world.find_persistent("Arena.Counter").is_none());
    let levels: Vec<LevelIndex> = session
        .drain_events()
        .into_iter()
        .filter_map(|e| match e {
            SessionEvent::LevelChanged { index, .. } => Some(index),
            _ => None,
        })
        .collect();
    assert_eq!(levels, vec![LevelIndex(0), LevelIndex(1)]);
}

#[test]
fn seeking_across_a_level_boundary_reloads_the_level() {
    let store = MemoryStore::new();
    record_two_levels(&store);
    let mut world = arena_world();
    let mut session = Session::new(store.clone(), config()).unwrap();
    session.play(STREAM, &world).unwrap();

    session.goto(3.05).unwrap();
    session.tick(&mut world, 0.0).unwrap();
    assert_eq!(world.current_level(), "Bridge");
    assert_eq!(counter(&world, "Bridge"), Some(FieldValue::Int(110)));

    session.goto(1.05).unwrap();
    session.tick(&mut world, 0.0).unwrap();
    assert_eq!(world.current_level(), "Arena");
    assert_eq!(counter(&world, "Arena"), Some(FieldValue::Int(10)));
    assert_eq!(session.player().unwrap().level(), Some(LevelIndex(0)));
}

#[test]
fn level_transition_writes_a_header_entry_and_checkpoint() {
    let store = MemoryStore::new();
    record_two_levels(&store);
    let world = arena_world();
    let mut session = Session::new(store.clone(), config()).unwrap();
    session.play(STREAM, &world).unwrap();

    let header = session.player().unwrap().header().clone();
    let names: Vec<&str> = header.levels.iter().map(|l| l.name.as_str()).collect();
    assert_eq!(names, vec!["Arena", "Bridge"]);
    assert_eq!(header.levels[1].start_ms, 2000);
    assert!(store.checkpoint_times(STREAM).contains(&2000));
}

/// A preserved pawn recorded through a level change: one second in
/// `Arena`, then one second in `Bridge` with its health set to `100 + i`.
fn record_survivor(store: &MemoryStore) {
    let mut world = arena_world();
    let scout = world.spawn_tagged(PAWN, "scout");
    world.obj_mut(scout).preserved = true;
    let mut session = Session::new(store.clone(), config()).unwrap();
    session.record(STREAM, &world).unwrap();
    for i in 0..10 {
        world.set(scout, "health", FieldValue::Int(i));
        session.tick(&mut world, 0.1).unwrap();
    }

    let recorder = session.recorder_mut().unwrap();
    recorder.begin_level_transition("Bridge").unwrap();
    world.load_level("Bridge").unwrap();
    recorder.finish_level_transition(&world).unwrap();
    assert!(world.contains(scout));

    for i in 0..10 {
        world.set(scout, "health", FieldValue::Int(100 + i));
        session.tick(&mut world, 0.1).unwrap();
    }
    session.stop().unwrap();
}

fn scout_health(world: &MockWorld) -> Option<FieldValue> {
    world
        .find_tagged("scout")
        .and_then(|h| world.get(h, "health"))
}

#[test]
fn object_surviving_a_level_change_is_announced_again() {
    let store = MemoryStore::new();
    record_survivor(&store);

    let mut continuous = arena_world();
    let mut session = Session::new(store.clone(), config()).unwrap();
    session.play(STREAM, &continuous).unwrap();
    session.tick(&mut continuous, 0.0).unwrap();
    for _ in 0..18 {
        session.tick(&mut continuous, 0.1).unwrap();
    }

    let mut seeked = arena_world();
    let mut seeker = Session::new(store.clone(), config()).unwrap();
    seeker.play(STREAM, &seeked).unwrap();
    seeker.goto(1.8).unwrap();
    seeker.tick(&mut seeked, 0.0).unwrap();

    assert_eq!(scout_health(&continuous), Some(FieldValue::Int(108)));
    assert_eq!(scout_health(&seeked), Some(FieldValue::Int(108)));
    assert_eq!(continuous.world_state(), seeked.world_state());
}

// ── Side channels ───────────────────────────────────────────────

#[test]
fn aux_data_and_streaming_levels_reach_the_playback_world() {
    let mut live = Live::start();
    live.advance(3);
    let counter_handle = live.world.find_persistent("Arena.Counter").unwrap();
    let recorder = live.session.recorder_mut().unwrap();
    recorder.queue_aux_data(counter_handle, b"round=2".to_vec());
    recorder.queue_streaming_level("Arena_Lights", "Arena_Lights_Night");
    live.advance(3);
    live.session.stop().unwrap();

    let mut world = arena_world();
    let mut viewer = Session::new(live.store.clone(), config()).unwrap();
    viewer.play(STREAM, &world).unwrap();
    viewer.tick(&mut world, 0.0).unwrap();
    for _ in 0..6 {
        viewer.tick(&mut world, 0.1).unwrap();
    }

    let played_counter = world.find_persistent("Arena.Counter").unwrap();
    assert_eq!(
        world.aux_received,
        vec![(played_counter, b"round=2".to_vec())]
    );
    assert_eq!(
        world.streamed_levels,
        vec![("Arena_Lights".to_string(), "Arena_Lights_Night".to_string())]
    );
}
