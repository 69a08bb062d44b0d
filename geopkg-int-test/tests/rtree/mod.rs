//! Deferred R-tree maintenance tests.
//!
//! These run against file-backed datasets so the background builder and its
//! staging database take part.

mod background_build_test;
mod equivalence_test;
mod sink_failure_test;
