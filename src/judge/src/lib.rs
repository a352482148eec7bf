//! Judging worker: connects to the dispatch server, keeps its problem data
//! cache in sync, compiles submissions and runs them case by case under the
//! external limiter, streaming results back.

pub mod config;
pub mod judging;
pub mod limiter;
pub mod problem;
pub mod session;
