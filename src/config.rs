//! Simulation configuration
//!
//! `SimulationBuilder` is a fluent `with_*` / `get_*` builder. `build`
//! validates every value once, so agents and the sender can assume a sane
//! configuration.

use std::time::Duration;

use crate::channel::AgingPolicy;
use crate::decisions::DecisionRates;
use crate::errors::{PlatoonError, Result};

/// What the heartbeat sender emits
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HeartbeatMode {
    /// Random payloads, sync flags and injected errors
    Random,
    /// Error-free sync heartbeats at a fixed cruise speed
    LeadVehicle { speed: u32 },
}

/// Per-agent settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AgentConfig {
    pub tick_period: Duration,
    pub receive_timeout: Duration,
    /// Leader re-evaluation happens every this many ticks
    pub turn_frequency: u64,
    pub max_window_size: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            tick_period: Duration::from_millis(crate::TICK_PERIOD_MS),
            receive_timeout: Duration::from_millis(crate::RECEIVE_TIMEOUT_MS),
            turn_frequency: crate::TURN_FREQUENCY,
            max_window_size: crate::DEFAULT_MAX_WINDOW_SIZE,
        }
    }
}

/// Heartbeat sender settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SenderConfig {
    pub interval: Duration,
    /// Bump every channel's age after this many sends; 0 never bumps
    pub age_bump_every: u64,
    pub mode: HeartbeatMode,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(crate::TICK_PERIOD_MS),
            age_bump_every: crate::AGE_BUMP_EVERY,
            mode: HeartbeatMode::Random,
        }
    }
}

/// Validated settings for a whole run
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationConfig {
    pub vehicle_count: u32,
    pub seed: u64,
    pub agent: AgentConfig,
    pub sender: SenderConfig,
    pub aging_policy: AgingPolicy,
    pub obstacle_deceleration: f64,
    pub loss_rate: f64,
    pub decision_rates: DecisionRates,
    /// Initial speeds are drawn uniformly from this range
    pub initial_speed: (f64, f64),
}

impl SimulationConfig {
    pub fn builder() -> SimulationBuilder {
        SimulationBuilder::new()
    }
}

pub struct SimulationBuilder {
    config: SimulationConfig,
}

impl SimulationBuilder {
    pub fn new() -> Self {
        Self {
            config: SimulationConfig {
                vehicle_count: 5,
                seed: 0,
                agent: AgentConfig::default(),
                sender: SenderConfig::default(),
                aging_policy: AgingPolicy::default(),
                obstacle_deceleration: crate::OBSTACLE_DECELERATION,
                loss_rate: crate::DEFAULT_LOSS_RATE,
                decision_rates: DecisionRates::default(),
                initial_speed: (40.0, 60.0),
            },
        }
    }

    pub fn with_vehicle_count(mut self, count: u32) -> Self {
        self.config.vehicle_count = count;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.config.seed = seed;
        self
    }

    pub fn with_tick_period(mut self, period: Duration) -> Self {
        self.config.agent.tick_period = period;
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.config.agent.receive_timeout = timeout;
        self
    }

    pub fn with_turn_frequency(mut self, ticks: u64) -> Self {
        self.config.agent.turn_frequency = ticks;
        self
    }

    pub fn with_max_window_size(mut self, size: u32) -> Self {
        self.config.agent.max_window_size = size;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.sender.interval = interval;
        self
    }

    pub fn with_age_bump_every(mut self, sends: u64) -> Self {
        self.config.sender.age_bump_every = sends;
        self
    }

    pub fn with_heartbeat_mode(mut self, mode: HeartbeatMode) -> Self {
        self.config.sender.mode = mode;
        self
    }

    pub fn with_aging_policy(mut self, policy: AgingPolicy) -> Self {
        self.config.aging_policy = policy;
        self
    }

    pub fn with_obstacle_deceleration(mut self, step: f64) -> Self {
        self.config.obstacle_deceleration = step;
        self
    }

    pub fn with_loss_rate(mut self, rate: f64) -> Self {
        self.config.loss_rate = rate;
        self
    }

    pub fn with_decision_rates(mut self, rates: DecisionRates) -> Self {
        self.config.decision_rates = rates;
        self
    }

    pub fn with_initial_speed(mut self, min: f64, max: f64) -> Self {
        self.config.initial_speed = (min, max);
        self
    }

    pub fn get_vehicle_count(&self) -> u32 {
        self.config.vehicle_count
    }

    pub fn get_tick_period(&self) -> Duration {
        self.config.agent.tick_period
    }

    pub fn get_receive_timeout(&self) -> Duration {
        self.config.agent.receive_timeout
    }

    pub fn get_max_window_size(&self) -> u32 {
        self.config.agent.max_window_size
    }

    /// Validate and produce the configuration
    ///
    /// # Errors
    /// Returns `InvalidConfig` naming the first offending setting.
    pub fn build(self) -> Result<SimulationConfig> {
        let config = self.config;

        if config.vehicle_count == 0 {
            return Err(invalid("vehicle_count must be at least 1"));
        }
        if config.agent.tick_period.is_zero() || config.sender.interval.is_zero() {
            return Err(invalid("tick_period and heartbeat interval must be non-zero"));
        }
        if config.agent.turn_frequency == 0 {
            return Err(invalid("turn_frequency must be at least 1"));
        }
        if config.agent.max_window_size == 0 {
            return Err(invalid("max_window_size must be at least 1"));
        }
        if !config.obstacle_deceleration.is_finite() || config.obstacle_deceleration <= 0.0 {
            return Err(invalid("obstacle_deceleration must be a positive number"));
        }

        let rates = config.decision_rates;
        for (name, value) in [
            ("loss_rate", config.loss_rate),
            ("turn_desire", rates.turn_desire),
            ("intersection_arrival", rates.intersection_arrival),
            ("turn_feasible", rates.turn_feasible),
            ("obstacle", rates.obstacle),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(PlatoonError::InvalidConfig(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }

        let (min, max) = config.initial_speed;
        if !(min.is_finite() && max.is_finite() && 0.0 <= min && min < max && max <= crate::MAX_SPEED) {
            return Err(PlatoonError::InvalidConfig(format!(
                "initial speed range {}..{} must lie within [0, {}]",
                min,
                max,
                crate::MAX_SPEED
            )));
        }

        if let HeartbeatMode::LeadVehicle { speed } = config.sender.mode {
            if speed >= 1 << crate::PAYLOAD_WIDTH {
                return Err(PlatoonError::InvalidConfig(format!(
                    "lead vehicle speed {} does not fit in a {}-bit payload",
                    speed,
                    crate::PAYLOAD_WIDTH
                )));
            }
        }

        Ok(config)
    }
}

impl Default for SimulationBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn invalid(message: &str) -> PlatoonError {
    PlatoonError::InvalidConfig(message.to_string())
}
