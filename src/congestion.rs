//! Congestion controller - Reno-style window over RLNC-coded dissemination
//!
//! Slow start doubles the window while `cwnd < ssthresh`; congestion avoidance
//! adds one. Both are capped at `max_window_size`. The first lost packet of a
//! tick halves the threshold, resets the window to one and ends the tick.

use std::collections::VecDeque;

use tracing::{debug, trace};

use crate::coding::{CodedPacket, RlncEncoder};
use crate::contracts::VehicleId;
use crate::decisions::{CoefficientSource, LossModel};
use crate::errors::{PlatoonError, Result};

/// Pending data units kept for coding; older units are evicted first
pub const PENDING_DATA_CAPACITY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPhase {
    SlowStart,
    CongestionAvoidance,
}

/// Outcome of one controller tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowReport {
    /// Phase the window grew in this tick
    pub phase: WindowPhase,
    /// Window after growth and any loss reaction
    pub cwnd: u32,
    pub ssthresh: u32,
    /// Packets generated before the first loss (or all of them)
    pub delivered: Vec<CodedPacket>,
    /// Index of the packet whose loss reset the window
    pub lost_at: Option<usize>,
}

/// Window state forwarded to whoever consumes congestion feedback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowFeedback {
    pub vehicle_id: VehicleId,
    pub cwnd: u32,
    pub ssthresh: u32,
}

#[derive(Debug, Clone)]
pub struct CongestionController {
    cwnd: u32,
    ssthresh: u32,
    max_window_size: u32,
    pending: VecDeque<i64>,
    encoder: RlncEncoder,
}

impl CongestionController {
    /// Start in slow start with `cwnd = 1` and `ssthresh = max / 2`
    ///
    /// # Errors
    /// Returns `InvalidConfig` if `max_window_size` is zero.
    pub fn new(max_window_size: u32) -> Result<Self> {
        Self::with_state(1, (max_window_size / 2).max(1), max_window_size)
    }

    /// Start from an explicit window state
    pub fn with_state(cwnd: u32, ssthresh: u32, max_window_size: u32) -> Result<Self> {
        if max_window_size == 0 {
            return Err(PlatoonError::InvalidConfig(
                "max_window_size must be at least 1".to_string(),
            ));
        }
        if cwnd == 0 || cwnd > max_window_size {
            return Err(PlatoonError::InvalidConfig(format!(
                "cwnd {} outside 1..={}",
                cwnd, max_window_size
            )));
        }
        if ssthresh == 0 {
            return Err(PlatoonError::InvalidConfig("ssthresh must be at least 1".to_string()));
        }

        Ok(Self {
            cwnd,
            ssthresh,
            max_window_size,
            pending: VecDeque::with_capacity(PENDING_DATA_CAPACITY),
            encoder: RlncEncoder::default(),
        })
    }

    pub fn with_encoder(mut self, encoder: RlncEncoder) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn cwnd(&self) -> u32 {
        self.cwnd
    }

    pub fn ssthresh(&self) -> u32 {
        self.ssthresh
    }

    pub fn max_window_size(&self) -> u32 {
        self.max_window_size
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Queue a data unit for dissemination
    pub fn push_data(&mut self, unit: i64) {
        if self.pending.len() == PENDING_DATA_CAPACITY {
            self.pending.pop_front();
        }
        self.pending.push_back(unit);
    }

    /// Grow the window, then send up to `cwnd` coded packets
    pub fn on_tick(
        &mut self,
        coefficients: &mut dyn CoefficientSource,
        loss: &mut dyn LossModel,
    ) -> WindowReport {
        let phase = if self.cwnd < self.ssthresh {
            self.cwnd = self.cwnd.saturating_mul(2);
            WindowPhase::SlowStart
        } else {
            self.cwnd = self.cwnd.saturating_add(1);
            WindowPhase::CongestionAvoidance
        };
        self.cwnd = self.cwnd.min(self.max_window_size);

        let data = self.pending.make_contiguous().to_vec();
        let mut delivered = Vec::with_capacity(self.cwnd as usize);
        let mut lost_at = None;

        for index in 0..self.cwnd as usize {
            let Some(packet) = self.encoder.encode_one(&data, coefficients) else {
                break;
            };

            if loss.should_drop(index) {
                lost_at = Some(index);
                self.ssthresh = (self.cwnd / 2).max(1);
                self.cwnd = 1;
                debug!(
                    packet_index = index,
                    ssthresh = self.ssthresh,
                    "coded packet lost, window reset to slow start"
                );
                break;
            }

            trace!(packet_index = index, value = packet.value, "coded packet sent");
            delivered.push(packet);
        }

        WindowReport {
            phase,
            cwnd: self.cwnd,
            ssthresh: self.ssthresh,
            delivered,
            lost_at,
        }
    }
}
