pub mod fake_engine;

pub use fake_engine::{unpack, FakeEngine, FakeRun};
