//! Structured logging and Prometheus metrics consumed by the rest of the
//! core via narrow recorder types (SPEC_FULL.md §2, §4.14, §4.15).

pub mod log;
pub mod metrics;
