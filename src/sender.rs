//! Heartbeat sender - periodic producer feeding every vehicle's channel
//!
//! Sources decide what goes into a heartbeat; the sender decides when. The
//! random source injects real corruption matching the declared error type so
//! the codec has something to detect.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::channel::HeartbeatChannel;
use crate::contracts::{ErrorType, Heartbeat, Payload};
use crate::errors::Result;

/// Pluggable heartbeat producer
pub trait HeartbeatSource: Send {
    fn next_heartbeat(&mut self) -> Heartbeat;
}

/// Random payloads with a random sync flag, error type and priority
pub struct RandomHeartbeatSource {
    rng: ChaCha8Rng,
    width: u8,
}

impl RandomHeartbeatSource {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            width: crate::PAYLOAD_WIDTH,
        }
    }

    fn random_payload(&mut self) -> Payload {
        Payload::truncated(self.rng.gen(), self.width)
    }

    fn corrupt(&mut self, clean: Payload, error: ErrorType) -> (Payload, Vec<Payload>) {
        let width = clean.width() as usize;
        match error {
            ErrorType::Clean => (clean, Vec::new()),

            ErrorType::SingleBit => {
                let index = self.rng.gen_range(0..clean.width());
                (clean.flipped(index), Vec::new())
            }

            ErrorType::DoubleBit if width >= 2 => {
                let picked = sample(&mut self.rng, width, 2);
                let corrupted = picked
                    .iter()
                    .fold(clean, |payload, index| payload.flipped(index as u8));
                (corrupted, Vec::new())
            }
            ErrorType::DoubleBit => (clean.flipped(0), Vec::new()),

            ErrorType::Burst => {
                let span = self.rng.gen_range(2..=width.max(2)).min(width);
                let start = self.rng.gen_range(0..=(width - span));
                let corrupted = (start..start + span)
                    .fold(clean, |payload, index| payload.flipped(index as u8));
                (corrupted, vec![clean, corrupted, clean])
            }
        }
    }
}

impl HeartbeatSource for RandomHeartbeatSource {
    fn next_heartbeat(&mut self) -> Heartbeat {
        let clean = self.random_payload();
        let sync = self.rng.gen_bool(0.5);
        let priority = self.rng.gen_range(1..=10);
        let error = ErrorType::ALL[self.rng.gen_range(0..ErrorType::ALL.len())];

        let (corrupted, copies) = self.corrupt(clean, error);
        Heartbeat::new(clean, sync, priority)
            .with_error(error, corrupted)
            .with_redundant_copies(copies)
    }
}

/// Lead vehicle broadcasting its cruise speed as sync heartbeats
pub struct LeadVehicleSource {
    payload: Payload,
    priority: u32,
}

impl LeadVehicleSource {
    pub fn new(speed: u32) -> Result<Self> {
        Ok(Self {
            payload: Payload::from_value(speed, crate::PAYLOAD_WIDTH)?,
            priority: 1,
        })
    }
}

impl HeartbeatSource for LeadVehicleSource {
    fn next_heartbeat(&mut self) -> Heartbeat {
        Heartbeat::new(self.payload, true, self.priority)
    }
}

/// Emits one heartbeat per channel every interval
pub struct HeartbeatSender {
    channels: Vec<Arc<HeartbeatChannel>>,
    source: Box<dyn HeartbeatSource>,
    interval: Duration,
    age_bump_every: u64,
    sends: u64,
}

impl HeartbeatSender {
    pub fn new(
        channels: Vec<Arc<HeartbeatChannel>>,
        source: Box<dyn HeartbeatSource>,
        interval: Duration,
    ) -> Self {
        Self {
            channels,
            source,
            interval,
            age_bump_every: 0,
            sends: 0,
        }
    }

    /// Bump every channel's age after this many sends; 0 disables aging
    pub fn with_age_bump_every(mut self, sends: u64) -> Self {
        self.age_bump_every = sends;
        self
    }

    pub fn sends(&self) -> u64 {
        self.sends
    }

    /// Send one round: a fresh heartbeat into every channel
    pub fn send_round(&mut self) {
        for channel in &self.channels {
            let heartbeat = self.source.next_heartbeat();
            trace!(
                payload = %heartbeat.payload,
                error = ?heartbeat.error,
                sync = heartbeat.sync,
                priority = heartbeat.priority,
                "sending heartbeat"
            );
            channel.enqueue(heartbeat);
        }

        self.sends += 1;
        if self.age_bump_every > 0 && self.sends % self.age_bump_every == 0 {
            for channel in &self.channels {
                channel.bump_age();
            }
        }
    }

    /// Send rounds until the stop signal fires
    ///
    /// # Returns
    /// Number of rounds sent
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> u64 {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *stop.borrow() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => self.send_round(),
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        debug!(rounds = self.sends, "heartbeat sender stopped");
        self.sends
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ErrorCodec;
    use crate::contracts::ErrorCounters;

    #[test]
    fn test_random_source_corruption_matches_error_type() {
        let mut source = RandomHeartbeatSource::new(21);

        for _ in 0..500 {
            let heartbeat = source.next_heartbeat();
            assert!((1..=10).contains(&heartbeat.priority));

            match heartbeat.error {
                ErrorType::Clean => {
                    assert_eq!(heartbeat.payload.parity(), heartbeat.parity);
                }
                ErrorType::SingleBit => {
                    assert_ne!(heartbeat.payload.parity(), heartbeat.parity);
                }
                ErrorType::DoubleBit => {
                    assert_eq!(heartbeat.payload.parity(), heartbeat.parity);
                }
                ErrorType::Burst => {
                    assert_eq!(heartbeat.redundant_copies.len(), 3);
                    let mut counters = ErrorCounters::default();
                    let decoded = ErrorCodec::detect_and_correct(heartbeat.clone(), &mut counters);
                    assert!(decoded.is_success());
                    assert_eq!(decoded.heartbeat.payload, heartbeat.redundant_copies[0]);
                }
            }
        }
    }

    #[test]
    fn test_lead_vehicle_source() {
        let mut source = LeadVehicleSource::new(50).unwrap();
        let heartbeat = source.next_heartbeat();
        assert!(heartbeat.sync);
        assert_eq!(heartbeat.payload.value(), 50);
        assert_eq!(heartbeat.error, ErrorType::Clean);

        assert!(LeadVehicleSource::new(300).is_err());
    }

    #[test]
    fn test_send_round_fills_channels_and_bumps_age() {
        let channels: Vec<_> = (0..3).map(|_| Arc::new(HeartbeatChannel::new())).collect();
        let source = Box::new(LeadVehicleSource::new(80).unwrap());
        let mut sender = HeartbeatSender::new(channels.clone(), source, Duration::from_secs(1))
            .with_age_bump_every(2);

        sender.send_round();
        sender.send_round();
        sender.send_round();

        for channel in &channels {
            assert_eq!(channel.len(), 3);
            assert_eq!(channel.age_factor(), 1);
        }
        assert_eq!(sender.sends(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_signal() {
        let channel = Arc::new(HeartbeatChannel::new());
        let source = Box::new(LeadVehicleSource::new(60).unwrap());
        let sender = HeartbeatSender::new(vec![Arc::clone(&channel)], source, Duration::from_secs(1));
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = tokio::spawn(sender.run(stop_rx));
        tokio::time::sleep(Duration::from_millis(2500)).await;
        stop_tx.send(true).unwrap();

        let rounds = handle.await.unwrap();
        // Interval fires immediately, then at 1s and 2s
        assert_eq!(rounds, 3);
        assert_eq!(channel.len(), 3);
    }
}
