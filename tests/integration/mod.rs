//! Integration test suite for the constellation orchestrator.
//!
//! These tests drive the public API end to end: editing constellations
//! through named commands, and dispatching work to scripted mock devices
//! over the in-memory transport.
//!
//! # Test Categories
//!
//! - `command_scenarios`: Editing, validation and undo/redo
//! - `dispatch`: Registration handshake and single-task dispatch
//! - `batch`: Bounded-concurrency and dependency-ordered execution
//! - `reconnect`: Lost links, missed heartbeats and retry budgets
//!
//! # CI Compatibility
//!
//! No sockets are opened. Time-dependent scenarios run with tokio's paused
//! clock, so they finish instantly.

mod fixtures;

mod batch;
mod command_scenarios;
mod dispatch;
mod reconnect;
