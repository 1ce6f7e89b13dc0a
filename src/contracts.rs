//! Core data structures for the platoon protocol
//!
//! Heartbeats carry a fixed-width bit payload with a single even-parity bit.
//! Vehicles are plain records owned by the registry; agents and the
//! coordinator refer to each other only through `VehicleId`.
use std::fmt;

use crate::errors::{PlatoonError, Result};

/// Widest payload a heartbeat can carry
pub const MAX_PAYLOAD_WIDTH: u8 = 32;

/// Registry key for a vehicle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VehicleId(pub u32);

impl fmt::Display for VehicleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vehicle-{}", self.0)
    }
}

/// Travel direction at the next intersection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Straight,
    Left,
    Right,
}

impl Direction {
    /// All directions, in the order random pickers index them
    pub const ALL: [Direction; 3] = [Direction::Straight, Direction::Left, Direction::Right];

    pub fn is_turn(&self) -> bool {
        !matches!(self, Direction::Straight)
    }
}

/// Fixed-width bit string
///
/// Bit index 0 is the leftmost (most significant) bit, matching how the
/// payload reads when printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Payload {
    bits: u32,
    width: u8,
}

impl Payload {
    /// Create a payload from an integer value
    ///
    /// # Errors
    /// Returns `InvalidPayload` if the width is 0 or above `MAX_PAYLOAD_WIDTH`,
    /// or if the value does not fit in `width` bits.
    pub fn from_value(value: u32, width: u8) -> Result<Self> {
        if width == 0 || width > MAX_PAYLOAD_WIDTH {
            return Err(PlatoonError::InvalidPayload(format!(
                "width {} outside 1..={}",
                width, MAX_PAYLOAD_WIDTH
            )));
        }

        if width < MAX_PAYLOAD_WIDTH && value >> width != 0 {
            return Err(PlatoonError::InvalidPayload(format!(
                "value {} does not fit in {} bits",
                value, width
            )));
        }

        Ok(Self { bits: value, width })
    }

    /// Keep the low `width` bits of `value`; width is clamped into `1..=32`
    pub fn truncated(value: u32, width: u8) -> Self {
        let width = width.clamp(1, MAX_PAYLOAD_WIDTH);
        let bits = if width == MAX_PAYLOAD_WIDTH {
            value
        } else {
            value & ((1u32 << width) - 1)
        };
        Self { bits, width }
    }

    /// Parse a `0`/`1` string such as `"01100100"`
    pub fn parse(text: &str) -> Result<Self> {
        let width = u8::try_from(text.len())
            .map_err(|_| PlatoonError::InvalidPayload(format!("{} bits is too wide", text.len())))?;

        let mut bits = 0u32;
        for ch in text.chars() {
            let bit = match ch {
                '0' => 0,
                '1' => 1,
                other => {
                    return Err(PlatoonError::InvalidPayload(format!(
                        "unexpected character {:?} in {:?}",
                        other, text
                    )))
                }
            };
            bits = (bits << 1) | bit;
        }

        Self::from_value(bits, width)
    }

    pub fn value(&self) -> u32 {
        self.bits
    }

    pub fn width(&self) -> u8 {
        self.width
    }

    pub fn count_ones(&self) -> u32 {
        self.bits.count_ones()
    }

    /// Even parity bit: 1 when the number of set bits is odd
    pub fn parity(&self) -> u8 {
        (self.count_ones() % 2) as u8
    }

    /// Bit at `index`, counted from the left
    pub fn bit(&self, index: u8) -> Option<bool> {
        self.mask(index).map(|mask| self.bits & mask != 0)
    }

    /// Copy of this payload with the bit at `index` inverted
    ///
    /// Out-of-range indices return the payload unchanged.
    pub fn flipped(&self, index: u8) -> Self {
        match self.mask(index) {
            Some(mask) => Self { bits: self.bits ^ mask, width: self.width },
            None => *self,
        }
    }

    fn mask(&self, index: u8) -> Option<u32> {
        (index < self.width).then(|| 1u32 << (self.width - 1 - index))
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:0width$b}", self.bits, width = self.width as usize)
    }
}

/// Corruption class a heartbeat was sent with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorType {
    Clean,
    SingleBit,
    DoubleBit,
    Burst,
}

impl ErrorType {
    pub const ALL: [ErrorType; 4] = [
        ErrorType::Clean,
        ErrorType::SingleBit,
        ErrorType::DoubleBit,
        ErrorType::Burst,
    ];
}

/// Heartbeat - synchronization message from the sender to one vehicle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heartbeat {
    /// Possibly corrupted payload as received
    pub payload: Payload,

    /// Even parity of the payload before any corruption
    pub parity: u8,

    /// Whether receivers should adopt the payload as their speed
    pub sync: bool,

    pub error: ErrorType,

    /// Payload variants for burst correction by majority vote
    pub redundant_copies: Vec<Payload>,

    /// Lower is more urgent
    pub priority: u32,
}

impl Heartbeat {
    /// Create a clean heartbeat; parity is computed from `payload`
    pub fn new(payload: Payload, sync: bool, priority: u32) -> Self {
        Self {
            payload,
            parity: payload.parity(),
            sync,
            error: ErrorType::Clean,
            redundant_copies: Vec::new(),
            priority,
        }
    }

    /// Replace the payload with a corrupted variant, keeping the clean parity
    pub fn with_error(mut self, error: ErrorType, corrupted: Payload) -> Self {
        self.error = error;
        self.payload = corrupted;
        self
    }

    pub fn with_redundant_copies(mut self, copies: Vec<Payload>) -> Self {
        self.redundant_copies = copies;
        self
    }
}

/// Per-vehicle tally of detected error events
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorCounters {
    pub single_bit: u64,
    pub double_bit: u64,
    pub burst: u64,
}

impl ErrorCounters {
    pub fn total(&self) -> u64 {
        self.single_bit + self.double_bit + self.burst
    }
}

/// Coordination state of a vehicle agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentState {
    Unsynchronized,
    Synchronized,
    ObstacleAvoidance,
    IntersectionYielding,
    Turning,
}

/// Vehicle record held by the registry
#[derive(Debug, Clone, PartialEq)]
pub struct Vehicle {
    pub id: VehicleId,

    /// Distance travelled; never decreases
    pub position: f64,

    /// Current speed, kept within `[0, MAX_SPEED]`
    pub speed: f64,

    pub synchronized: bool,

    pub direction: Direction,

    /// Registry key of the vehicle being followed
    pub leader: Option<VehicleId>,

    pub obstacle_detected: bool,

    pub state: AgentState,

    /// State to return to once obstacle avoidance ends
    pub resume_state: AgentState,
}

impl Vehicle {
    /// Create an unsynchronized vehicle at position zero
    ///
    /// The initial speed is clamped into `[0, MAX_SPEED]`.
    pub fn new(id: VehicleId, speed: f64, direction: Direction) -> Self {
        Self {
            id,
            position: 0.0,
            speed: clamp_speed(speed),
            synchronized: false,
            direction,
            leader: None,
            obstacle_detected: false,
            state: AgentState::Unsynchronized,
            resume_state: AgentState::Unsynchronized,
        }
    }

    /// State the vehicle settles in when no transient condition applies
    pub fn base_state(&self) -> AgentState {
        if self.synchronized {
            AgentState::Synchronized
        } else {
            AgentState::Unsynchronized
        }
    }

    pub fn set_speed(&mut self, speed: f64) {
        self.speed = clamp_speed(speed);
    }

    /// Advance position by the current speed
    pub fn advance(&mut self) {
        self.position += self.speed;
    }

    /// Flag an obstacle and remember the state to return to
    pub fn enter_obstacle_avoidance(&mut self) {
        if self.state != AgentState::ObstacleAvoidance {
            self.resume_state = self.base_state_or(self.state);
        }
        self.obstacle_detected = true;
        self.state = AgentState::ObstacleAvoidance;
    }

    /// Turning and yielding only last one tick, so they resume as the base state
    fn base_state_or(&self, state: AgentState) -> AgentState {
        match state {
            AgentState::Turning | AgentState::IntersectionYielding => self.base_state(),
            other => other,
        }
    }
}

fn clamp_speed(speed: f64) -> f64 {
    if speed.is_nan() {
        return 0.0;
    }
    speed.clamp(0.0, crate::MAX_SPEED)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_parse_and_display() {
        let payload = Payload::parse("01100100").unwrap();
        assert_eq!(payload.value(), 100);
        assert_eq!(payload.width(), 8);
        assert_eq!(payload.to_string(), "01100100");
        assert_eq!(payload.parity(), 1);

        assert!(Payload::parse("0120").is_err());
        assert!(Payload::parse("").is_err());
    }

    #[test]
    fn test_payload_value_validation() {
        assert!(Payload::from_value(255, 8).is_ok());
        assert!(Payload::from_value(256, 8).is_err());
        assert!(Payload::from_value(u32::MAX, 32).is_ok());
        assert!(Payload::from_value(1, 33).is_err());

        assert_eq!(Payload::truncated(0x1ff, 8).value(), 0xff);
        assert_eq!(Payload::truncated(7, 0).width(), 1);
    }

    #[test]
    fn test_payload_flip_counts_from_left() {
        let payload = Payload::parse("0000").unwrap();
        assert_eq!(payload.flipped(0).to_string(), "1000");
        assert_eq!(payload.flipped(3).to_string(), "0001");
        assert_eq!(payload.flipped(4), payload);
        assert_eq!(payload.flipped(0).bit(0), Some(true));
        assert_eq!(payload.bit(9), None);
    }

    #[test]
    fn test_heartbeat_parity_is_taken_before_corruption() {
        let clean = Payload::parse("101").unwrap();
        let heartbeat = Heartbeat::new(clean, true, 3)
            .with_error(ErrorType::SingleBit, clean.flipped(1));

        assert_eq!(heartbeat.parity, 0);
        assert_eq!(heartbeat.payload.to_string(), "111");
    }

    #[test]
    fn test_vehicle_speed_is_clamped() {
        let mut vehicle = Vehicle::new(VehicleId(1), 500.0, Direction::Straight);
        assert_eq!(vehicle.speed, crate::MAX_SPEED);

        vehicle.set_speed(-3.0);
        assert_eq!(vehicle.speed, 0.0);
        vehicle.set_speed(f64::NAN);
        assert_eq!(vehicle.speed, 0.0);
    }

    #[test]
    fn test_obstacle_resume_state() {
        let mut vehicle = Vehicle::new(VehicleId(1), 50.0, Direction::Left);
        vehicle.synchronized = true;
        vehicle.state = AgentState::Turning;

        vehicle.enter_obstacle_avoidance();
        assert_eq!(vehicle.state, AgentState::ObstacleAvoidance);
        assert_eq!(vehicle.resume_state, AgentState::Synchronized);

        // A second notification must not overwrite the saved state
        vehicle.enter_obstacle_avoidance();
        assert_eq!(vehicle.resume_state, AgentState::Synchronized);
    }

    #[test]
    fn test_yielding_vehicle_resumes_base_state() {
        let mut vehicle = Vehicle::new(VehicleId(1), 0.0, Direction::Right);
        vehicle.state = AgentState::IntersectionYielding;

        vehicle.enter_obstacle_avoidance();
        assert_eq!(vehicle.resume_state, AgentState::Unsynchronized);
    }
}
