//! Reusable schemas and worlds.
//!
//! Three classes cover the field codecs the engine has to move:
//!
//! - [`DOOR`]: a persistent object with a bool and a float.
//! - [`PAWN`]: a dynamic object with a text tag, an int and a vector.
//! - [`COUNTER`]: a single int, convenient for time-indexed assertions.

use rewind_core::{ClassId, ClassSchema, FieldCodec, SchemaRegistry};

use crate::MockWorld;

pub const DOOR: ClassId = ClassId(1);
pub const PAWN: ClassId = ClassId(2);
pub const COUNTER: ClassId = ClassId(3);

pub fn door_schema() -> ClassSchema {
    ClassSchema::new(DOOR, "Door")
        .with_field("open", FieldCodec::Bool)
        .with_field("angle", FieldCodec::Float)
}

pub fn pawn_schema() -> ClassSchema {
    ClassSchema::new(PAWN, "Pawn")
        .with_field("tag", FieldCodec::Text)
        .with_field("health", FieldCodec::Int)
        .with_field("position", FieldCodec::Vector)
}

pub fn counter_schema() -> ClassSchema {
    ClassSchema::new(COUNTER, "Counter").with_field("value", FieldCodec::Int)
}

pub fn schemas() -> SchemaRegistry {
    SchemaRegistry::new()
        .with(door_schema())
        .with(pawn_schema())
        .with(counter_schema())
}

/// A world with two levels, `Arena` loaded.
///
/// `Arena` places `Arena.Door_1`, `Arena.Door_2` and `Arena.Counter`;
/// `Bridge` places `Bridge.Door` and `Bridge.Counter`.
pub fn arena_world() -> MockWorld {
    use rewind_core::Simulation;

    let mut world = MockWorld::new(schemas())
        .with_level(
            "Arena",
            &[
                ("Arena.Door_1", DOOR),
                ("Arena.Door_2", DOOR),
                ("Arena.Counter", COUNTER),
            ],
        )
        .with_level("Bridge", &[("Bridge.Door", DOOR), ("Bridge.Counter", COUNTER)]);
    if let Err(e) = world.load_level("Arena") {
        panic!("fixture level failed to load: {e}");
    }
    world.level_loads = 0;
    world
}
