//! Process-level plumbing shared by the runtimes.

/// Graceful shutdown handling
pub mod shutdown;
