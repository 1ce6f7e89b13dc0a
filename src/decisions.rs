//! Pluggable decision providers
//!
//! Every randomized choice in the protocol (packet loss, coding coefficients,
//! turning, intersection arrival, obstacle detection, speed jitter) goes
//! through one of these traits. Simulations use the seeded ChaCha8
//! implementations; tests use the scripted ones.

use std::collections::VecDeque;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::contracts::Direction;

/// Per-packet loss decision for the congestion controller
pub trait LossModel: Send {
    fn should_drop(&mut self, packet_index: usize) -> bool;
}

/// Source of RLNC coefficients
pub trait CoefficientSource: Send {
    /// Next coefficient in `[0, bound)`
    fn next_coefficient(&mut self, bound: u8) -> u8;
}

/// Randomized choices made by a vehicle agent during a tick
pub trait DecisionProvider: Send {
    fn wants_to_turn(&mut self) -> bool;

    fn at_intersection(&mut self) -> bool;

    fn can_turn(&mut self) -> bool;

    /// Extra distance covered while turning
    fn turn_distance(&mut self) -> f64;

    fn detects_obstacle(&mut self) -> bool;

    /// Random-walk step applied to autonomous speed
    fn speed_jitter(&mut self) -> f64;

    /// Direction picked after completing a turn
    fn next_direction(&mut self) -> Direction;
}

/// Drops each packet independently with probability `rate`
pub struct BernoulliLoss {
    rng: ChaCha8Rng,
    rate: f64,
}

impl BernoulliLoss {
    pub fn new(seed: u64, rate: f64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            rate: rate.clamp(0.0, 1.0),
        }
    }
}

impl LossModel for BernoulliLoss {
    fn should_drop(&mut self, _packet_index: usize) -> bool {
        self.rng.gen_bool(self.rate)
    }
}

/// Never drops
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLoss;

impl LossModel for NoLoss {
    fn should_drop(&mut self, _packet_index: usize) -> bool {
        false
    }
}

/// Replays a fixed sequence of loss decisions, then delivers everything
#[derive(Debug, Clone, Default)]
pub struct ScriptedLoss {
    decisions: VecDeque<bool>,
}

impl ScriptedLoss {
    pub fn new(decisions: impl IntoIterator<Item = bool>) -> Self {
        Self {
            decisions: decisions.into_iter().collect(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.decisions.len()
    }
}

impl LossModel for ScriptedLoss {
    fn should_drop(&mut self, _packet_index: usize) -> bool {
        self.decisions.pop_front().unwrap_or(false)
    }
}

/// Uniform coefficients from a seeded generator
pub struct RandomCoefficients {
    rng: ChaCha8Rng,
}

impl RandomCoefficients {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }
}

impl CoefficientSource for RandomCoefficients {
    fn next_coefficient(&mut self, bound: u8) -> u8 {
        if bound == 0 {
            return 0;
        }
        self.rng.gen_range(0..bound)
    }
}

/// Cycles through a fixed list, reduced modulo the bound
#[derive(Debug, Clone)]
pub struct FixedCoefficients {
    values: Vec<u8>,
    cursor: usize,
}

impl FixedCoefficients {
    pub fn new(values: Vec<u8>) -> Self {
        Self { values, cursor: 0 }
    }
}

impl CoefficientSource for FixedCoefficients {
    fn next_coefficient(&mut self, bound: u8) -> u8 {
        if self.values.is_empty() || bound == 0 {
            return 0;
        }
        let value = self.values[self.cursor % self.values.len()];
        self.cursor += 1;
        value % bound
    }
}

/// Probabilities used by `RandomDecisions`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecisionRates {
    pub turn_desire: f64,
    pub intersection_arrival: f64,
    pub turn_feasible: f64,
    pub obstacle: f64,
}

impl Default for DecisionRates {
    fn default() -> Self {
        Self {
            turn_desire: 0.3,
            intersection_arrival: 0.1,
            turn_feasible: 0.7,
            obstacle: 0.05,
        }
    }
}

/// Seeded random decisions
pub struct RandomDecisions {
    rng: ChaCha8Rng,
    rates: DecisionRates,
}

impl RandomDecisions {
    pub fn new(seed: u64, rates: DecisionRates) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            rates,
        }
    }

    fn roll(&mut self, probability: f64) -> bool {
        self.rng.gen_bool(probability.clamp(0.0, 1.0))
    }
}

impl DecisionProvider for RandomDecisions {
    fn wants_to_turn(&mut self) -> bool {
        self.roll(self.rates.turn_desire)
    }

    fn at_intersection(&mut self) -> bool {
        self.roll(self.rates.intersection_arrival)
    }

    fn can_turn(&mut self) -> bool {
        self.roll(self.rates.turn_feasible)
    }

    fn turn_distance(&mut self) -> f64 {
        self.rng.gen_range(5.0..10.0)
    }

    fn detects_obstacle(&mut self) -> bool {
        self.roll(self.rates.obstacle)
    }

    fn speed_jitter(&mut self) -> f64 {
        let bound = crate::SPEED_JITTER;
        self.rng.gen_range(-bound..=bound)
    }

    fn next_direction(&mut self) -> Direction {
        Direction::ALL[self.rng.gen_range(0..Direction::ALL.len())]
    }
}

/// Constant answers for deterministic agent tests
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedDecisions {
    pub wants_to_turn: bool,
    pub at_intersection: bool,
    pub can_turn: bool,
    pub turn_distance: f64,
    pub detects_obstacle: bool,
    pub speed_jitter: f64,
    pub next_direction: Direction,
}

impl Default for FixedDecisions {
    fn default() -> Self {
        Self {
            wants_to_turn: false,
            at_intersection: false,
            can_turn: false,
            turn_distance: 0.0,
            detects_obstacle: false,
            speed_jitter: 0.0,
            next_direction: Direction::Straight,
        }
    }
}

impl DecisionProvider for FixedDecisions {
    fn wants_to_turn(&mut self) -> bool {
        self.wants_to_turn
    }

    fn at_intersection(&mut self) -> bool {
        self.at_intersection
    }

    fn can_turn(&mut self) -> bool {
        self.can_turn
    }

    fn turn_distance(&mut self) -> f64 {
        self.turn_distance
    }

    fn detects_obstacle(&mut self) -> bool {
        self.detects_obstacle
    }

    fn speed_jitter(&mut self) -> f64 {
        self.speed_jitter
    }

    fn next_direction(&mut self) -> Direction {
        self.next_direction
    }
}
