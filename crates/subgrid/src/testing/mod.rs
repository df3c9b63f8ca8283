//! Testing infrastructure for code built on the engine.
//!
//! - `FakeEntityService`: scripted in-memory `EntityService` with call counters

pub mod fake_service;

pub use fake_service::FakeEntityService;
