//! Simulation - wires the registry, channels, agents and sender together
//!
//! `Simulation::start` registers the vehicles and spawns one task per agent
//! plus the heartbeat sender. `shutdown` raises the stop signal, joins every
//! task and collects a report.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::agent::{AgentReport, VehicleAgent};
use crate::channel::HeartbeatChannel;
use crate::config::{HeartbeatMode, SimulationConfig};
use crate::congestion::WindowFeedback;
use crate::contracts::{Direction, Vehicle, VehicleId};
use crate::coordinator::PlatoonCoordinator;
use crate::decisions::{BernoulliLoss, RandomCoefficients, RandomDecisions};
use crate::errors::{PlatoonError, Result};
use crate::metrics::{InMemoryMetrics, MetricsSummary};
use crate::sender::{HeartbeatSender, HeartbeatSource, LeadVehicleSource, RandomHeartbeatSource};

/// Everything a finished run produced
#[derive(Debug, Clone)]
pub struct SimulationReport {
    pub agents: Vec<AgentReport>,
    pub heartbeat_rounds: u64,
    /// Final registry contents, ordered by id
    pub vehicles: Vec<Vehicle>,
    /// Congestion feedback in the order agents sent it
    pub feedback: Vec<WindowFeedback>,
    pub summary: MetricsSummary,
}

pub struct Simulation {
    coordinator: PlatoonCoordinator,
    channels: BTreeMap<VehicleId, Arc<HeartbeatChannel>>,
    metrics: Arc<InMemoryMetrics>,
    stop: watch::Sender<bool>,
    sender: JoinHandle<u64>,
    agents: Vec<JoinHandle<AgentReport>>,
    feedback: mpsc::UnboundedReceiver<WindowFeedback>,
}

impl Simulation {
    /// Register the vehicles and spawn every task
    ///
    /// Must be called from within a tokio runtime. Every random choice is
    /// derived from `config.seed`.
    ///
    /// # Errors
    /// Returns `InvalidConfig` for a lead-vehicle speed that does not fit the
    /// payload, or any registration error.
    pub fn start(config: SimulationConfig) -> Result<Self> {
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
        let coordinator = PlatoonCoordinator::new(config.obstacle_deceleration);
        let metrics = Arc::new(InMemoryMetrics::new());
        let (stop, stop_rx) = watch::channel(false);
        let (feedback_tx, feedback) = mpsc::unbounded_channel();
        let epoch = Instant::now();

        let (min_speed, max_speed) = config.initial_speed;
        let mut channels = BTreeMap::new();
        for index in 0..config.vehicle_count {
            let id = VehicleId(index);
            let speed = rng.gen_range(min_speed..max_speed);
            let direction = Direction::ALL[rng.gen_range(0..Direction::ALL.len())];
            coordinator.register(Vehicle::new(id, speed, direction))?;
            channels.insert(id, Arc::new(HeartbeatChannel::with_policy(config.aging_policy)));
        }

        let source: Box<dyn HeartbeatSource> = match config.sender.mode {
            HeartbeatMode::Random => Box::new(RandomHeartbeatSource::new(rng.gen())),
            HeartbeatMode::LeadVehicle { speed } => Box::new(LeadVehicleSource::new(speed)?),
        };

        let mut agents = Vec::with_capacity(channels.len());
        for (&id, channel) in &channels {
            let agent = VehicleAgent::new(
                id,
                config.agent,
                Arc::clone(channel),
                coordinator.clone(),
                metrics.clone(),
            )?
            .with_decisions(Box::new(RandomDecisions::new(rng.gen(), config.decision_rates)))
            .with_loss_model(Box::new(BernoulliLoss::new(rng.gen(), config.loss_rate)))
            .with_coefficients(Box::new(RandomCoefficients::new(rng.gen())))
            .with_feedback(feedback_tx.clone())
            .with_epoch(epoch);

            agents.push(tokio::spawn(agent.run(stop_rx.clone())));
        }

        let sender = HeartbeatSender::new(channels.values().cloned().collect(), source, config.sender.interval)
            .with_age_bump_every(config.sender.age_bump_every);
        let sender = tokio::spawn(sender.run(stop_rx));

        info!(
            vehicles = config.vehicle_count,
            seed = config.seed,
            mode = ?config.sender.mode,
            aging = ?config.aging_policy,
            "simulation started"
        );

        Ok(Self {
            coordinator,
            channels,
            metrics,
            stop,
            sender,
            agents,
            feedback,
        })
    }

    pub fn coordinator(&self) -> &PlatoonCoordinator {
        &self.coordinator
    }

    pub fn metrics(&self) -> &InMemoryMetrics {
        &self.metrics
    }

    pub fn channel(&self, id: VehicleId) -> Result<&Arc<HeartbeatChannel>> {
        self.channels.get(&id).ok_or(PlatoonError::UnknownVehicle(id))
    }

    /// Stop every task and collect the report
    ///
    /// Agents blocked on a dequeue finish their current tick first, so this
    /// returns within one receive timeout.
    ///
    /// # Errors
    /// Returns `TaskJoin` if any task panicked.
    pub async fn shutdown(mut self) -> Result<SimulationReport> {
        self.stop.send_replace(true);

        let heartbeat_rounds = self.sender.await?;
        let mut agents = Vec::with_capacity(self.agents.len());
        for handle in self.agents {
            agents.push(handle.await?);
        }

        let mut feedback = Vec::new();
        while let Ok(item) = self.feedback.try_recv() {
            feedback.push(item);
        }
        debug!(feedback = feedback.len(), "congestion feedback drained");

        let summary = self.metrics.summary();
        info!(
            rounds = heartbeat_rounds,
            records = summary.records,
            average_speed = summary.average_speed,
            total_distance = summary.total_distance,
            "simulation finished"
        );

        Ok(SimulationReport {
            agents,
            heartbeat_rounds,
            vehicles: self.coordinator.vehicles(),
            feedback,
            summary,
        })
    }
}

/// Start a simulation, let it run for `duration`, then shut it down
pub async fn run_for(config: SimulationConfig, duration: Duration) -> Result<SimulationReport> {
    let simulation = Simulation::start(config)?;
    tokio::time::sleep(duration).await;
    simulation.shutdown().await
}
