//! Scenario-based tests for deployflow

mod cancellation;
mod escalation;
mod event_stream;
mod retry_budget;
mod saga_compensation;
