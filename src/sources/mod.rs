// Snapshot sources that ship with the crate
// Real vendor adapters live downstream, these are for demos and tests

pub mod replay; // JSON file of recorded snapshot batches

pub use replay::{ReplayFile, ReplaySource, REPLAY_KIND};
