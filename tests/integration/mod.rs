//! Integration test suite for the foreman orchestration core.
//!
//! These tests drive the public API end to end: plan ingestion, readiness
//! and dispatch, reconciliation, pool allocation under contention, and
//! whole workflows running against a mock agent runner.
//!
//! # Test Categories
//!
//! - `graph_dispatch`: readiness, ordering, and dispatch scenarios
//! - `reconcile`: plan re-ingestion and the three-way merge
//! - `pool_allocation`: agent pool contention and conservation
//! - `workflow_e2e`: full workflow execution against a mock runner
//!
//! # CI Compatibility
//!
//! No real agent processes are spawned; the mock runner returns canned
//! output, so the suite is safe in CI.

mod fixtures;

mod graph_dispatch;
mod pool_allocation;
mod reconcile;
mod workflow_e2e;
