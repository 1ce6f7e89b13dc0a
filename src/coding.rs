//! Random linear network coding encoder
//!
//! Each coded packet is `sum(c_i * data_i)` over all pending data units, with
//! one fresh coefficient per unit per packet. Only encoding is modeled; the
//! coefficients travel with the packet so a receiver could solve for the
//! source units, but no decoder is provided.

use crate::decisions::CoefficientSource;

/// One RLNC-coded packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodedPacket {
    /// One coefficient per source unit, in source order
    pub coefficients: Vec<u8>,

    /// Linear combination of the source units
    pub value: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RlncEncoder {
    coefficient_range: u8,
}

impl RlncEncoder {
    /// Coefficients are drawn from `[0, coefficient_range)`
    pub fn new(coefficient_range: u8) -> Self {
        Self { coefficient_range }
    }

    pub fn coefficient_range(&self) -> u8 {
        self.coefficient_range
    }

    /// Encode a single packet; `None` when there is nothing to combine
    pub fn encode_one(&self, data: &[i64], source: &mut dyn CoefficientSource) -> Option<CodedPacket> {
        if data.is_empty() {
            return None;
        }

        let coefficients: Vec<u8> = data
            .iter()
            .map(|_| source.next_coefficient(self.coefficient_range))
            .collect();

        let value = coefficients
            .iter()
            .zip(data)
            .fold(0i64, |acc, (c, unit)| acc.saturating_add(unit.saturating_mul(i64::from(*c))));

        Some(CodedPacket { coefficients, value })
    }

    /// Encode `count` packets over `data`
    pub fn encode(&self, data: &[i64], count: usize, source: &mut dyn CoefficientSource) -> Vec<CodedPacket> {
        (0..count)
            .map_while(|_| self.encode_one(data, source))
            .collect()
    }
}

impl Default for RlncEncoder {
    fn default() -> Self {
        Self::new(crate::COEFFICIENT_RANGE)
    }
}
