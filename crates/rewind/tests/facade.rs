//! The facade re-exports are enough to record and replay a world.

use rewind::prelude::*;
use rewind::replay::MemoryStore;
use rewind_test_utils::fixtures::arena_world;

#[test]
fn record_and_replay_through_the_prelude() {
    let store = MemoryStore::new();
    let mut world = arena_world();
    let counter = world.find_persistent("Arena.Counter").unwrap();
    let mut config = SessionConfig::default();
    config.record.max_record_hz = 10.0;
    let mut session = Session::new(store.clone(), config).unwrap();
    session.record("facade", &world).unwrap();
    for i in 0..10 {
        world.set(counter, "value", FieldValue::Int(i));
        session.tick(&mut world, 0.1).unwrap();
    }
    session.stop().unwrap();

    let mut replay = arena_world();
    session.play("facade", &replay).unwrap();
    session.tick(&mut replay, 0.0).unwrap();
    for _ in 0..9 {
        session.tick(&mut replay, 0.1).unwrap();
    }
    assert_eq!(
        replay.get_path("Arena.Counter", "value"),
        Some(FieldValue::Int(9))
    );
    assert_eq!(
        session.player().map(|p| p.state()),
        Some(PlaybackState::Streaming)
    );
}
