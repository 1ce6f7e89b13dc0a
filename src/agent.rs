//! Vehicle agent - per-vehicle coordination state machine
//!
//! One agent drives one registered vehicle. Each tick it handles a pending
//! obstacle, re-evaluates its leader, waits a bounded time for a heartbeat,
//! decodes it, updates speed and position, runs congestion control, handles
//! intersections and obstacle detection, and records metrics.
//!
//! The registry lock is taken only for short synchronous sections and is
//! never held while waiting on the channel.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::channel::{HeartbeatChannel, Reception};
use crate::codec::{Decoded, ErrorCodec};
use crate::config::AgentConfig;
use crate::congestion::{CongestionController, WindowFeedback, WindowReport};
use crate::contracts::{AgentState, Direction, ErrorCounters, Vehicle, VehicleId};
use crate::coordinator::PlatoonCoordinator;
use crate::decisions::{
    CoefficientSource, DecisionProvider, FixedDecisions, LossModel, NoLoss, RandomCoefficients,
};
use crate::errors::{PlatoonError, Result};
use crate::metrics::{MetricsRecord, MetricsSink};

/// What the heartbeat step did this tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// Sync heartbeat accepted; speed adopted from the payload
    Synchronized,
    /// Non-sync heartbeat accepted; autonomous adjustment applied
    Autonomous,
    /// Heartbeat could not be corrected and was discarded
    Dropped,
    /// Channel stayed empty until the timeout
    NoHeartbeat,
    /// An obstacle broadcast arrived during the wait; nothing was applied
    Preempted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntersectionAction {
    Straight,
    Turned,
    Yielded,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub heartbeat: HeartbeatOutcome,
    pub intersection: Option<IntersectionAction>,
    /// Congestion controller result, present after an accepted heartbeat
    pub window: Option<WindowReport>,
    /// Vehicles notified when this vehicle detected an obstacle
    pub obstacle_notified: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// The tick was spent decelerating for an obstacle
    AvoidingObstacle,
    Completed(TickReport),
}

/// Final state of an agent after its loop exits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentReport {
    pub vehicle_id: VehicleId,
    pub ticks: u64,
    pub errors: ErrorCounters,
    pub cwnd: u32,
    pub ssthresh: u32,
}

/// Intersection choices drawn before taking the registry lock
#[derive(Debug, Clone, Copy)]
struct TurnPlan {
    can_turn: bool,
    distance: f64,
    next_direction: Direction,
}

pub struct VehicleAgent {
    id: VehicleId,
    config: AgentConfig,
    channel: Arc<HeartbeatChannel>,
    coordinator: PlatoonCoordinator,
    metrics: Arc<dyn MetricsSink>,
    congestion: CongestionController,
    decisions: Box<dyn DecisionProvider>,
    loss: Box<dyn LossModel>,
    coefficients: Box<dyn CoefficientSource>,
    feedback: Option<mpsc::UnboundedSender<WindowFeedback>>,
    counters: ErrorCounters,
    ticks: u64,
    /// Ticks not spent avoiding an obstacle; drives the periodic leader check
    driving_ticks: u64,
    epoch: Instant,
}

impl VehicleAgent {
    /// Create an agent for a vehicle already registered with `coordinator`
    ///
    /// Defaults to fixed no-op decisions, no packet loss and coefficients
    /// seeded from the vehicle id; use the `with_*` methods to replace them.
    ///
    /// # Errors
    /// Returns `UnknownVehicle` if `id` is not registered, or `InvalidConfig`
    /// if the window size or turn frequency is zero.
    pub fn new(
        id: VehicleId,
        config: AgentConfig,
        channel: Arc<HeartbeatChannel>,
        coordinator: PlatoonCoordinator,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        coordinator.snapshot(id)?;
        if config.turn_frequency == 0 {
            return Err(PlatoonError::InvalidConfig("turn_frequency must be at least 1".to_string()));
        }
        let congestion = CongestionController::new(config.max_window_size)?;

        Ok(Self {
            id,
            config,
            channel,
            coordinator,
            metrics,
            congestion,
            decisions: Box::new(FixedDecisions::default()),
            loss: Box::new(NoLoss),
            coefficients: Box::new(RandomCoefficients::new(u64::from(id.0))),
            feedback: None,
            counters: ErrorCounters::default(),
            ticks: 0,
            driving_ticks: 0,
            epoch: Instant::now(),
        })
    }

    pub fn with_decisions(mut self, decisions: Box<dyn DecisionProvider>) -> Self {
        self.decisions = decisions;
        self
    }

    pub fn with_loss_model(mut self, loss: Box<dyn LossModel>) -> Self {
        self.loss = loss;
        self
    }

    pub fn with_coefficients(mut self, coefficients: Box<dyn CoefficientSource>) -> Self {
        self.coefficients = coefficients;
        self
    }

    pub fn with_congestion(mut self, congestion: CongestionController) -> Self {
        self.congestion = congestion;
        self
    }

    pub fn with_feedback(mut self, feedback: mpsc::UnboundedSender<WindowFeedback>) -> Self {
        self.feedback = Some(feedback);
        self
    }

    /// Reference point for metrics timestamps
    pub fn with_epoch(mut self, epoch: Instant) -> Self {
        self.epoch = epoch;
        self
    }

    pub fn id(&self) -> VehicleId {
        self.id
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn error_counters(&self) -> ErrorCounters {
        self.counters
    }

    pub fn congestion(&self) -> &CongestionController {
        &self.congestion
    }

    /// Run one full tick
    ///
    /// # Errors
    /// Returns `UnknownVehicle` once this vehicle has been removed from the
    /// registry. Timeouts and bad heartbeats are handled internally.
    pub async fn tick(&mut self) -> Result<TickOutcome> {
        self.ticks += 1;

        if self.handle_obstacle()? {
            return Ok(TickOutcome::AvoidingObstacle);
        }
        self.driving_ticks += 1;

        let arriving = self.evaluate_leader()?;
        let reception = self.channel.dequeue(self.config.receive_timeout).await;
        self.complete_tick(reception, arriving).map(TickOutcome::Completed)
    }

    /// Tick until the stop signal fires or the vehicle disappears
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> AgentReport {
        let mut ticker = tokio::time::interval(self.config.tick_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *stop.borrow() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }

            match self.tick().await {
                Ok(outcome) => trace!(vehicle_id = %self.id, tick = self.ticks, ?outcome, "tick finished"),
                Err(err) => {
                    warn!(vehicle_id = %self.id, error = %err, "agent stopping");
                    break;
                }
            }
        }

        debug!(vehicle_id = %self.id, ticks = self.ticks, "agent stopped");
        AgentReport {
            vehicle_id: self.id,
            ticks: self.ticks,
            errors: self.counters,
            cwnd: self.congestion.cwnd(),
            ssthresh: self.congestion.ssthresh(),
        }
    }

    /// Step 1: settle transient states and decelerate for a flagged obstacle
    ///
    /// Returns true when the tick was consumed by obstacle avoidance.
    fn handle_obstacle(&mut self) -> Result<bool> {
        let id = self.id;
        let deceleration = self.coordinator.obstacle_deceleration();

        self.coordinator.with_registry(|registry| -> Result<bool> {
            let vehicle = registry.get_mut(id)?;

            if matches!(vehicle.state, AgentState::Turning | AgentState::IntersectionYielding) {
                vehicle.state = vehicle.base_state();
            }

            if !vehicle.obstacle_detected {
                return Ok(false);
            }

            if vehicle.speed > 0.0 {
                vehicle.state = AgentState::ObstacleAvoidance;
                vehicle.set_speed(vehicle.speed - deceleration);
                debug!(vehicle_id = %id, speed = vehicle.speed, "decelerating for obstacle");
            } else {
                vehicle.obstacle_detected = false;
                vehicle.state = vehicle.resume_state;
                info!(vehicle_id = %id, state = ?vehicle.state, "obstacle cleared");
            }
            Ok(true)
        })
    }

    /// Step 2: periodic or on-arrival leader assignment
    ///
    /// The period counts only ticks that got past obstacle handling. Returns
    /// whether the vehicle arrives at an intersection this tick.
    fn evaluate_leader(&mut self) -> Result<bool> {
        let arriving = self.decisions.at_intersection();
        let periodic =
            self.driving_ticks % self.config.turn_frequency == 0 && self.decisions.wants_to_turn();

        if periodic || arriving {
            self.coordinator.assign_leader(self.id)?;
        }
        Ok(arriving)
    }

    /// Steps 3 to 7, after the channel wait
    fn complete_tick(&mut self, reception: Reception, arriving: bool) -> Result<TickReport> {
        let decoded = match reception {
            Reception::Delivered { adjusted_priority, heartbeat } => {
                trace!(
                    vehicle_id = %self.id,
                    adjusted_priority,
                    payload = %heartbeat.payload,
                    "heartbeat received"
                );
                Some(ErrorCodec::detect_and_correct(heartbeat, &mut self.counters))
            }
            Reception::Empty => {
                debug!(vehicle_id = %self.id, "no heartbeat received, falling back to autonomous control");
                None
            }
        };

        // Draw every random choice up front so the registry section stays pure
        let jitter = self.decisions.speed_jitter();
        let turn_plan = arriving.then(|| TurnPlan {
            can_turn: self.decisions.can_turn(),
            distance: self.decisions.turn_distance(),
            next_direction: self.decisions.next_direction(),
        });

        let id = self.id;
        let (heartbeat, intersection, obstacle_flagged) =
            self.coordinator.with_registry(|registry| -> Result<_> {
                let leader_speed = registry.leader_speed(id);
                let vehicle = registry.get_mut(id)?;

                // A broadcast that landed during the wait owns the rest of the tick
                if vehicle.obstacle_detected {
                    debug!(vehicle_id = %id, "obstacle flagged while waiting, heartbeat not applied");
                    return Ok((HeartbeatOutcome::Preempted, None, true));
                }

                let heartbeat = apply_heartbeat(vehicle, decoded.as_ref(), leader_speed, jitter);
                let intersection = turn_plan.map(|plan| apply_intersection(vehicle, plan));
                Ok((heartbeat, intersection, vehicle.obstacle_detected))
            })?;

        let window = match &decoded {
            Some(decoded) if decoded.is_success() && heartbeat != HeartbeatOutcome::Preempted => {
                Some(self.run_congestion_control(decoded))
            }
            _ => None,
        };

        let obstacle_notified = if !obstacle_flagged && self.decisions.detects_obstacle() {
            Some(self.raise_obstacle()?)
        } else {
            None
        };

        let vehicle = self.coordinator.snapshot(id)?;
        self.record_metrics(&vehicle);

        Ok(TickReport {
            heartbeat,
            intersection,
            window,
            obstacle_notified,
        })
    }

    fn run_congestion_control(&mut self, decoded: &Decoded) -> WindowReport {
        self.congestion.push_data(i64::from(decoded.heartbeat.payload.value()));
        let report = self
            .congestion
            .on_tick(self.coefficients.as_mut(), self.loss.as_mut());

        if let Some(feedback) = &self.feedback {
            // A closed feedback channel only means nobody is listening any more
            let _ = feedback.send(WindowFeedback {
                vehicle_id: self.id,
                cwnd: report.cwnd,
                ssthresh: report.ssthresh,
            });
        }
        report
    }

    /// Step 6: flag our own obstacle and warn everybody else
    fn raise_obstacle(&mut self) -> Result<usize> {
        let id = self.id;
        self.coordinator.with_registry(|registry| {
            registry.get_mut(id).map(Vehicle::enter_obstacle_avoidance)
        })?;
        info!(vehicle_id = %id, "obstacle detected, initiating emergency procedures");
        self.coordinator.broadcast_obstacle(id)
    }

    fn record_metrics(&self, vehicle: &Vehicle) {
        self.metrics.record(MetricsRecord {
            vehicle_id: self.id,
            tick: self.ticks,
            timestamp_ms: u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX),
            speed: vehicle.speed,
            position: vehicle.position,
            cwnd: self.congestion.cwnd(),
            errors: self.counters,
        });
    }
}

fn apply_heartbeat(
    vehicle: &mut Vehicle,
    decoded: Option<&Decoded>,
    leader_speed: Option<f64>,
    jitter: f64,
) -> HeartbeatOutcome {
    match decoded {
        None => {
            adjust_autonomously(vehicle, leader_speed, jitter);
            HeartbeatOutcome::NoHeartbeat
        }
        Some(decoded) if !decoded.is_success() => {
            debug!(
                vehicle_id = %vehicle.id,
                error = ?decoded.heartbeat.error,
                "uncorrectable heartbeat dropped"
            );
            HeartbeatOutcome::Dropped
        }
        Some(decoded) if decoded.heartbeat.sync => {
            vehicle.synchronized = true;
            vehicle.state = AgentState::Synchronized;
            vehicle.set_speed(f64::from(decoded.heartbeat.payload.value()));
            if let Some(speed) = leader_speed {
                vehicle.set_speed(speed);
            }
            vehicle.advance();
            debug!(
                vehicle_id = %vehicle.id,
                speed = vehicle.speed,
                position = vehicle.position,
                "synchronized from heartbeat"
            );
            HeartbeatOutcome::Synchronized
        }
        Some(_) => {
            adjust_autonomously(vehicle, leader_speed, jitter);
            HeartbeatOutcome::Autonomous
        }
    }
}

/// Follow the leader if there is one, otherwise random-walk the speed
fn adjust_autonomously(vehicle: &mut Vehicle, leader_speed: Option<f64>, jitter: f64) {
    match leader_speed {
        Some(speed) => vehicle.set_speed(speed),
        None => vehicle.set_speed((vehicle.speed + jitter).clamp(crate::MIN_CRUISE_SPEED, crate::MAX_SPEED)),
    }
    vehicle.advance();
}

fn apply_intersection(vehicle: &mut Vehicle, plan: TurnPlan) -> IntersectionAction {
    if !vehicle.direction.is_turn() {
        trace!(vehicle_id = %vehicle.id, "proceeding straight through intersection");
        return IntersectionAction::Straight;
    }

    if plan.can_turn {
        info!(vehicle_id = %vehicle.id, direction = ?vehicle.direction, "turning at intersection");
        vehicle.position += plan.distance.max(0.0);
        vehicle.direction = plan.next_direction;
        vehicle.leader = None;
        vehicle.state = AgentState::Turning;
        IntersectionAction::Turned
    } else {
        debug!(vehicle_id = %vehicle.id, direction = ?vehicle.direction, "yielding at intersection");
        vehicle.set_speed(0.0);
        vehicle.state = AgentState::IntersectionYielding;
        IntersectionAction::Yielded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::contracts::{ErrorType, Heartbeat, Payload};
    use crate::decisions::{FixedCoefficients, ScriptedLoss};
    use crate::metrics::InMemoryMetrics;

    struct Fixture {
        coordinator: PlatoonCoordinator,
        channel: Arc<HeartbeatChannel>,
        metrics: Arc<InMemoryMetrics>,
    }

    impl Fixture {
        fn new(vehicles: Vec<Vehicle>) -> Self {
            let coordinator = PlatoonCoordinator::new(crate::OBSTACLE_DECELERATION);
            for vehicle in vehicles {
                coordinator.register(vehicle).unwrap();
            }
            Self {
                coordinator,
                channel: Arc::new(HeartbeatChannel::new()),
                metrics: Arc::new(InMemoryMetrics::new()),
            }
        }

        fn agent(&self, id: u32, decisions: FixedDecisions) -> VehicleAgent {
            self.agent_with_frequency(id, decisions, crate::TURN_FREQUENCY)
        }

        fn agent_with_frequency(&self, id: u32, decisions: FixedDecisions, turn_frequency: u64) -> VehicleAgent {
            let config = AgentConfig {
                receive_timeout: Duration::from_millis(100),
                turn_frequency,
                ..AgentConfig::default()
            };
            VehicleAgent::new(
                VehicleId(id),
                config,
                Arc::clone(&self.channel),
                self.coordinator.clone(),
                self.metrics.clone(),
            )
            .unwrap()
            .with_decisions(Box::new(decisions))
            .with_coefficients(Box::new(FixedCoefficients::new(vec![1])))
        }

        fn vehicle(&self, id: u32) -> Vehicle {
            self.coordinator.snapshot(VehicleId(id)).unwrap()
        }
    }

    fn vehicle(id: u32, position: f64, speed: f64, direction: Direction) -> Vehicle {
        let mut vehicle = Vehicle::new(VehicleId(id), speed, direction);
        vehicle.position = position;
        vehicle
    }

    fn sync_heartbeat(text: &str) -> Heartbeat {
        Heartbeat::new(Payload::parse(text).unwrap(), true, 1)
    }

    fn completed(outcome: TickOutcome) -> TickReport {
        match outcome {
            TickOutcome::Completed(report) => report,
            TickOutcome::AvoidingObstacle => panic!("tick was spent avoiding an obstacle"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_heartbeat_sets_speed_and_position() {
        let fixture = Fixture::new(vec![vehicle(1, 0.0, 45.0, Direction::Straight)]);
        let mut agent = fixture.agent(1, FixedDecisions::default());
        fixture.channel.enqueue(sync_heartbeat("01100100"));

        let report = completed(agent.tick().await.unwrap());

        assert_eq!(report.heartbeat, HeartbeatOutcome::Synchronized);
        let vehicle = fixture.vehicle(1);
        assert_eq!(vehicle.speed, 100.0);
        assert_eq!(vehicle.position, 100.0);
        assert!(vehicle.synchronized);
        assert_eq!(vehicle.state, AgentState::Synchronized);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_speed_capped_at_max() {
        let fixture = Fixture::new(vec![vehicle(1, 0.0, 45.0, Direction::Straight)]);
        let mut agent = fixture.agent(1, FixedDecisions::default());
        fixture.channel.enqueue(sync_heartbeat("11001000"));

        agent.tick().await.unwrap();

        let vehicle = fixture.vehicle(1);
        assert_eq!(vehicle.speed, crate::MAX_SPEED);
        assert_eq!(vehicle.position, crate::MAX_SPEED);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_heartbeat_overridden_by_leader() {
        let mut follower = vehicle(1, 0.0, 45.0, Direction::Straight);
        follower.leader = Some(VehicleId(2));
        let fixture = Fixture::new(vec![follower, vehicle(2, 500.0, 70.0, Direction::Straight)]);
        let mut agent = fixture.agent(1, FixedDecisions::default());
        fixture.channel.enqueue(sync_heartbeat("01100100"));

        agent.tick().await.unwrap();

        let vehicle = fixture.vehicle(1);
        assert_eq!(vehicle.speed, 70.0);
        assert_eq!(vehicle.position, 70.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_falls_back_to_random_walk() {
        let fixture = Fixture::new(vec![vehicle(1, 10.0, 50.0, Direction::Straight)]);
        let decisions = FixedDecisions { speed_jitter: 3.0, ..FixedDecisions::default() };
        let mut agent = fixture.agent(1, decisions);

        let report = completed(agent.tick().await.unwrap());

        assert_eq!(report.heartbeat, HeartbeatOutcome::NoHeartbeat);
        assert!(report.window.is_none());
        let vehicle = fixture.vehicle(1);
        assert_eq!(vehicle.speed, 53.0);
        assert_eq!(vehicle.position, 63.0);
        assert!(!vehicle.synchronized);
    }

    #[tokio::test(start_paused = true)]
    async fn test_random_walk_floor_after_yield() {
        let fixture = Fixture::new(vec![vehicle(1, 0.0, 0.0, Direction::Straight)]);
        let decisions = FixedDecisions { speed_jitter: -5.0, ..FixedDecisions::default() };
        let mut agent = fixture.agent(1, decisions);

        agent.tick().await.unwrap();

        assert_eq!(fixture.vehicle(1).speed, crate::MIN_CRUISE_SPEED);
    }

    #[tokio::test(start_paused = true)]
    async fn test_uncorrectable_heartbeat_is_dropped() {
        let fixture = Fixture::new(vec![vehicle(1, 5.0, 50.0, Direction::Straight)]);
        let mut agent = fixture.agent(1, FixedDecisions { speed_jitter: 4.0, ..FixedDecisions::default() });
        let clean = Payload::parse("01100100").unwrap();
        fixture
            .channel
            .enqueue(Heartbeat::new(clean, true, 1).with_error(ErrorType::DoubleBit, clean.flipped(0).flipped(1)));

        let report = completed(agent.tick().await.unwrap());

        assert_eq!(report.heartbeat, HeartbeatOutcome::Dropped);
        let vehicle = fixture.vehicle(1);
        assert_eq!(vehicle.speed, 50.0);
        assert_eq!(vehicle.position, 5.0);
        assert!(!vehicle.synchronized);
        assert_eq!(agent.error_counters().double_bit, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accepted_heartbeat_drives_congestion_window() {
        let fixture = Fixture::new(vec![vehicle(1, 0.0, 50.0, Direction::Straight)]);
        let (feedback_tx, mut feedback_rx) = mpsc::unbounded_channel();
        let mut agent = fixture
            .agent(1, FixedDecisions::default())
            .with_congestion(CongestionController::with_state(1, 2, 5).unwrap())
            .with_loss_model(Box::new(ScriptedLoss::new([false, false, false, false, false, true])))
            .with_feedback(feedback_tx);

        let mut windows = Vec::new();
        for _ in 0..3 {
            fixture.channel.enqueue(sync_heartbeat("00110010"));
            let report = completed(agent.tick().await.unwrap());
            windows.push(report.window.unwrap().cwnd);
        }

        // 1 -> 2 (slow start) -> 3 -> 4, loss on the sixth packet resets to 1
        assert_eq!(windows, vec![2, 3, 1]);
        assert_eq!(agent.congestion().ssthresh(), 2);

        let feedback = feedback_rx.recv().await.unwrap();
        assert_eq!(feedback.vehicle_id, VehicleId(1));
        assert_eq!(feedback.cwnd, 2);

        let records = fixture.metrics.records_for(VehicleId(1));
        assert_eq!(records.iter().map(|r| r.cwnd).collect::<Vec<_>>(), vec![2, 3, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_obstacle_detection_broadcasts_and_decelerates() {
        let fixture = Fixture::new(vec![
            vehicle(1, 0.0, 15.0, Direction::Straight),
            vehicle(2, 0.0, 50.0, Direction::Straight),
        ]);
        let decisions = FixedDecisions { detects_obstacle: true, ..FixedDecisions::default() };
        let mut agent = fixture.agent(1, decisions);
        fixture.channel.enqueue(sync_heartbeat("00010100"));

        let report = completed(agent.tick().await.unwrap());
        assert_eq!(report.obstacle_notified, Some(1));
        assert_eq!(fixture.vehicle(1).state, AgentState::ObstacleAvoidance);
        assert_eq!(fixture.vehicle(1).resume_state, AgentState::Synchronized);
        assert_eq!(fixture.vehicle(2).speed, 40.0);
        let recorded = fixture.metrics.len();

        // 20 -> 10 -> 0, then the flag clears on the following tick
        assert_eq!(agent.tick().await.unwrap(), TickOutcome::AvoidingObstacle);
        assert_eq!(fixture.vehicle(1).speed, 10.0);
        assert_eq!(agent.tick().await.unwrap(), TickOutcome::AvoidingObstacle);
        assert_eq!(fixture.vehicle(1).speed, 0.0);
        assert_eq!(agent.tick().await.unwrap(), TickOutcome::AvoidingObstacle);

        let vehicle = fixture.vehicle(1);
        assert!(!vehicle.obstacle_detected);
        assert_eq!(vehicle.state, AgentState::Synchronized);
        assert_eq!(fixture.metrics.len(), recorded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_during_wait_preempts_heartbeat() {
        let fixture = Fixture::new(vec![
            vehicle(1, 0.0, 50.0, Direction::Straight),
            vehicle(2, 10.0, 50.0, Direction::Straight),
        ]);
        let mut agent = fixture.agent(1, FixedDecisions::default());
        let coordinator = fixture.coordinator.clone();
        let channel = Arc::clone(&fixture.channel);

        let (outcome, notified) = tokio::join!(agent.tick(), async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let notified = coordinator.broadcast_obstacle(VehicleId(2)).unwrap();
            channel.enqueue(sync_heartbeat("01100100"));
            notified
        });
        assert_eq!(notified, 1);

        let report = completed(outcome.unwrap());
        assert_eq!(report.heartbeat, HeartbeatOutcome::Preempted);
        assert!(report.window.is_none());
        assert_eq!(report.obstacle_notified, None);

        // Only the broadcast's deceleration applies; the heartbeat is ignored
        let vehicle = fixture.vehicle(1);
        assert_eq!(vehicle.speed, 40.0);
        assert_eq!(vehicle.position, 0.0);
        assert_eq!(vehicle.state, AgentState::ObstacleAvoidance);
        assert!(vehicle.obstacle_detected);
        assert!(!vehicle.synchronized);
        assert_eq!(fixture.metrics.len(), 1);

        assert_eq!(agent.tick().await.unwrap(), TickOutcome::AvoidingObstacle);
        assert_eq!(fixture.vehicle(1).speed, 30.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_leader_check_on_turn_frequency() {
        let fixture = Fixture::new(vec![
            vehicle(1, 0.0, 40.0, Direction::Left),
            vehicle(2, 200.0, 70.0, Direction::Left),
        ]);
        let decisions = FixedDecisions { wants_to_turn: true, ..FixedDecisions::default() };
        let mut agent = fixture.agent_with_frequency(1, decisions, 3);

        for _ in 0..2 {
            agent.tick().await.unwrap();
            let vehicle = fixture.vehicle(1);
            assert_eq!(vehicle.leader, None);
            assert_eq!(vehicle.speed, 40.0);
        }

        agent.tick().await.unwrap();
        let vehicle = fixture.vehicle(1);
        assert_eq!(vehicle.leader, Some(VehicleId(2)));
        assert_eq!(vehicle.speed, 70.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_obstacle_ticks_do_not_advance_leader_period() {
        let fixture = Fixture::new(vec![
            vehicle(1, 0.0, 10.0, Direction::Left),
            vehicle(2, 200.0, 70.0, Direction::Left),
        ]);
        let decisions = FixedDecisions { wants_to_turn: true, ..FixedDecisions::default() };
        let mut agent = fixture.agent_with_frequency(1, decisions, 3);

        completed(agent.tick().await.unwrap());
        fixture.coordinator.with_registry(|registry| {
            registry.get_mut(VehicleId(1)).unwrap().enter_obstacle_avoidance();
        });

        // 10 -> 0, then the flag clears
        assert_eq!(agent.tick().await.unwrap(), TickOutcome::AvoidingObstacle);
        assert_eq!(agent.tick().await.unwrap(), TickOutcome::AvoidingObstacle);

        completed(agent.tick().await.unwrap());
        assert_eq!(fixture.vehicle(1).leader, None);

        completed(agent.tick().await.unwrap());
        let vehicle = fixture.vehicle(1);
        assert_eq!(vehicle.leader, Some(VehicleId(2)));
        assert_eq!(vehicle.speed, 70.0);
        assert_eq!(agent.ticks(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_turn_at_intersection_resets_direction_and_leader() {
        let mut turning = vehicle(1, 0.0, 50.0, Direction::Left);
        turning.leader = Some(VehicleId(2));
        let fixture = Fixture::new(vec![turning, vehicle(2, 300.0, 50.0, Direction::Left)]);
        let decisions = FixedDecisions {
            at_intersection: true,
            can_turn: true,
            turn_distance: 7.0,
            next_direction: Direction::Straight,
            ..FixedDecisions::default()
        };
        let mut agent = fixture.agent(1, decisions);

        let report = completed(agent.tick().await.unwrap());

        assert_eq!(report.intersection, Some(IntersectionAction::Turned));
        let vehicle = fixture.vehicle(1);
        // Arrival re-assigned vehicle 2 as leader, then the turn cleared it
        assert_eq!(vehicle.leader, None);
        assert_eq!(vehicle.direction, Direction::Straight);
        assert_eq!(vehicle.position, 57.0);
        assert_eq!(vehicle.state, AgentState::Turning);
    }

    #[tokio::test(start_paused = true)]
    async fn test_yield_at_intersection_then_resume() {
        let fixture = Fixture::new(vec![vehicle(1, 0.0, 50.0, Direction::Right)]);
        let decisions = FixedDecisions { at_intersection: true, can_turn: false, ..FixedDecisions::default() };
        let mut agent = fixture.agent(1, decisions);

        let report = completed(agent.tick().await.unwrap());
        assert_eq!(report.intersection, Some(IntersectionAction::Yielded));
        let vehicle = fixture.vehicle(1);
        assert_eq!(vehicle.speed, 0.0);
        assert_eq!(vehicle.state, AgentState::IntersectionYielding);

        agent.tick().await.unwrap();
        // Yielding lasts one tick; the vehicle is still waiting to turn
        assert_eq!(fixture.vehicle(1).state, AgentState::IntersectionYielding);

        let mut straight = fixture.agent(1, FixedDecisions::default());
        straight.tick().await.unwrap();
        assert_eq!(fixture.vehicle(1).state, AgentState::Unsynchronized);
    }

    #[tokio::test(start_paused = true)]
    async fn test_straight_vehicle_ignores_intersection() {
        let fixture = Fixture::new(vec![vehicle(1, 0.0, 50.0, Direction::Straight)]);
        let decisions = FixedDecisions { at_intersection: true, can_turn: false, ..FixedDecisions::default() };
        let mut agent = fixture.agent(1, decisions);

        let report = completed(agent.tick().await.unwrap());

        assert_eq!(report.intersection, Some(IntersectionAction::Straight));
        assert_eq!(fixture.vehicle(1).speed, 50.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_vehicle_stops_agent() {
        let fixture = Fixture::new(vec![vehicle(1, 0.0, 50.0, Direction::Straight)]);
        let mut agent = fixture.agent(1, FixedDecisions::default());
        fixture.coordinator.remove(VehicleId(1));

        assert!(agent.tick().await.is_err());
    }
}
