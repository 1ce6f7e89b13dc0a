//! Error codec - heartbeat payload detection and correction
//!
//! Stateless. Single-bit errors are repaired against the parity bit, burst
//! errors by majority vote over redundant copies, and double-bit errors are
//! counted and rejected because one parity bit cannot see them.

use std::collections::HashMap;

use tracing::debug;

use crate::contracts::{ErrorCounters, ErrorType, Heartbeat, Payload};

/// Minimum redundant copies needed before a burst vote is trusted
pub const MIN_REDUNDANT_COPIES: usize = 3;

/// Outcome of running a heartbeat through the codec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    /// Payload was usable as received
    Clean,
    /// Payload was repaired in place
    Corrected,
    /// Payload must be discarded
    Uncorrectable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub heartbeat: Heartbeat,
    pub status: DecodeStatus,
}

impl Decoded {
    pub fn is_success(&self) -> bool {
        self.status != DecodeStatus::Uncorrectable
    }
}

pub struct ErrorCodec;

impl ErrorCodec {
    /// Detect and, where possible, correct the heartbeat's payload
    ///
    /// `counters` belongs to the receiving vehicle and is updated as an
    /// observability side effect: single-bit on an applied repair, double-bit
    /// and burst on every occurrence.
    pub fn detect_and_correct(mut heartbeat: Heartbeat, counters: &mut ErrorCounters) -> Decoded {
        let status = match heartbeat.error {
            ErrorType::Clean => DecodeStatus::Clean,

            ErrorType::SingleBit => {
                if heartbeat.payload.parity() == heartbeat.parity {
                    DecodeStatus::Clean
                } else {
                    match Self::correct_single_bit(heartbeat.payload, heartbeat.parity) {
                        Some(repaired) => {
                            heartbeat.payload = repaired;
                            counters.single_bit += 1;
                            DecodeStatus::Corrected
                        }
                        None => DecodeStatus::Uncorrectable,
                    }
                }
            }

            ErrorType::DoubleBit => {
                counters.double_bit += 1;
                DecodeStatus::Uncorrectable
            }

            ErrorType::Burst => {
                counters.burst += 1;
                if heartbeat.redundant_copies.len() < MIN_REDUNDANT_COPIES {
                    DecodeStatus::Uncorrectable
                } else {
                    match Self::majority_payload(&heartbeat.redundant_copies) {
                        Some(majority) if majority != heartbeat.payload => {
                            heartbeat.payload = majority;
                            DecodeStatus::Corrected
                        }
                        Some(_) => DecodeStatus::Clean,
                        None => DecodeStatus::Uncorrectable,
                    }
                }
            }
        };

        debug!(
            error = ?heartbeat.error,
            status = ?status,
            payload = %heartbeat.payload,
            "heartbeat decoded"
        );

        Decoded { heartbeat, status }
    }

    /// Flip the first bit, scanning from the left, that gives `parity`
    pub fn correct_single_bit(payload: Payload, parity: u8) -> Option<Payload> {
        (0..payload.width())
            .map(|index| payload.flipped(index))
            .find(|candidate| candidate.parity() == parity)
    }

    /// Most frequent payload; ties go to the value seen first
    pub fn majority_payload(copies: &[Payload]) -> Option<Payload> {
        let mut counts: HashMap<Payload, usize> = HashMap::with_capacity(copies.len());
        for copy in copies {
            *counts.entry(*copy).or_insert(0) += 1;
        }

        let mut best: Option<(Payload, usize)> = None;
        for copy in copies {
            let count = counts[copy];
            match best {
                Some((_, best_count)) if best_count >= count => {}
                _ => best = Some((*copy, count)),
            }
        }

        best.map(|(payload, _)| payload)
    }
}
