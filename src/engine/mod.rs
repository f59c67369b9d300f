//! Runtime engine: polling and the consumer-facing opportunity tracker.

pub mod scheduler;
pub mod tracker;

pub use scheduler::{
    AlwaysVisible, HostEnvironment, HostStatus, PollingConfig, PollingScheduler, PollingState,
    RefreshTarget, SimulatedHost,
};
pub use tracker::{OddsPayload, OpportunityTracker, TrackerConfig, TrackerState};
