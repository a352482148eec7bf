//! Central judging server: accepts authenticated worker connections, pulls
//! submission tasks from the external task source, dispatches each task to a
//! compatible idle worker and relays structured results back upstream.

pub mod config;
pub mod fetch;
pub mod queue;
pub mod registry;
pub mod reporter;
pub mod session;
pub mod web;
