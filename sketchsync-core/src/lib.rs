//! Replicated whiteboard document.
//!
//! A flat collection of shapes with typed properties. Replicas edit
//! concurrently without coordination and converge once they have applied the
//! same set of operations, in any order and with any duplication.

pub mod clock;
pub mod engine;
pub mod op;
pub mod shape;

pub use clock::{ClientId, LamportClock, OpId, StateVector};
pub use engine::{AppliedResult, ApplyStats, DeltaSet, DocumentEngine, EngineError, Snapshot};
pub use op::{OpError, OpKind, Operation};
pub use shape::{PropValue, Register, ShapeId, ShapeRecord, ShapeView};
