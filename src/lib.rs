//! Platoon Core - heartbeat-synchronized vehicle platooning protocol
//!
//! A group of vehicle agents cruise together. A sender pushes heartbeats into
//! one priority channel per vehicle; each agent decodes them (parity repair,
//! majority vote over redundant copies), adopts the advertised speed, follows
//! its leader, disseminates coded data under a Reno-style congestion window,
//! and reacts to obstacles and intersections.
//!
//! # Design Principles
//! - One registry lock, never held across an `.await`
//! - Vehicles refer to each other by id only
//! - Every random choice sits behind a seeded provider trait
//! - Channel timeouts and bad heartbeats are handled in the agent, never
//!   surfaced as errors

pub mod errors;
pub mod contracts;
pub mod channel;
pub mod codec;
pub mod decisions;
pub mod coding;
pub mod congestion;
pub mod coordinator;
pub mod metrics;
pub mod config;
pub mod sender;
pub mod agent;
pub mod simulation;

pub use agent::{AgentReport, HeartbeatOutcome, IntersectionAction, TickOutcome, TickReport, VehicleAgent};
pub use channel::{AgingPolicy, HeartbeatChannel, Reception};
pub use codec::{DecodeStatus, Decoded, ErrorCodec};
pub use config::{AgentConfig, HeartbeatMode, SenderConfig, SimulationBuilder, SimulationConfig};
pub use congestion::{CongestionController, WindowFeedback, WindowPhase, WindowReport};
pub use contracts::{AgentState, Direction, ErrorCounters, ErrorType, Heartbeat, Payload, Vehicle, VehicleId};
pub use coordinator::{PlatoonCoordinator, VehicleRegistry};
pub use errors::{PlatoonError, Result};
pub use metrics::{InMemoryMetrics, MetricsRecord, MetricsSink, MetricsSummary};
pub use sender::{HeartbeatSender, HeartbeatSource, LeadVehicleSource, RandomHeartbeatSource};
pub use simulation::{run_for, Simulation, SimulationReport};

/// Speed ceiling for every vehicle
pub const MAX_SPEED: f64 = 120.0;

/// Floor of the autonomous random walk
pub const MIN_CRUISE_SPEED: f64 = 10.0;

/// Largest autonomous speed change per tick, in either direction
pub const SPEED_JITTER: f64 = 5.0;

/// Speed removed per tick while avoiding an obstacle
pub const OBSTACLE_DECELERATION: f64 = 10.0;

/// Ticks between leader re-evaluations for vehicles that want to turn
pub const TURN_FREQUENCY: u64 = 5;

/// Heartbeat payload width in bits
pub const PAYLOAD_WIDTH: u8 = 8;

/// Congestion window ceiling
pub const DEFAULT_MAX_WINDOW_SIZE: u32 = 5;

/// RLNC coefficients are drawn from `0..COEFFICIENT_RANGE`
pub const COEFFICIENT_RANGE: u8 = 10;

/// Interval between agent ticks
pub const TICK_PERIOD_MS: u64 = 1000;

/// How long an agent waits for a heartbeat before going autonomous
pub const RECEIVE_TIMEOUT_MS: u64 = 1000;

/// Sender rounds between channel age bumps
pub const AGE_BUMP_EVERY: u64 = 5;

/// Probability that a coded packet is lost
pub const DEFAULT_LOSS_RATE: f64 = 0.5;
