//! End-to-end tests: trackers, cache and scheduler driven against an
//! in-memory odds source.

mod mock_source;
mod polling;
mod tracker_flow;
