//! Integration test suite for crewrun.
//!
//! These tests drive full runs through the engine and the coordinator with
//! scripted capabilities, and check scheduling, gating and event-ordering
//! behavior end to end.
//!
//! # Test Categories
//!
//! - `engine_e2e`: dependency ordering, concurrency and synthesis
//! - `gating`: gate policy in action, rejection, timeout, feedback
//! - `coordinator`: run lifecycle, cancellation, snapshot and resume

mod fixtures;

mod gating;
