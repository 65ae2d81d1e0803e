//! Counter rate derivation
//!
//! Hardware counters (octets, errors) only ever go up until they wrap at their
//! bit width or the device resets them. A rate is derived from two consecutive
//! readings of the same counter:
//!
//! ```text
//! v1 >= v0                 → (v1 - v0) * k / Δt
//! v1 <  v0, plausible wrap → (max - v0 + v1 + 1) * k / Δt
//! v1 <  v0, above ceiling  → 0, flagged discontinuous (device reset)
//! ```
//!
//! `k` is 8 for octet counters reported in bits per second and 1 for plain
//! per-second counts.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Declared width of a hardware counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterWidth {
    Bits32,
    Bits64,
}

impl CounterWidth {
    pub fn max_value(self) -> u64 {
        match self {
            CounterWidth::Bits32 => u32::MAX as u64,
            CounterWidth::Bits64 => u64::MAX,
        }
    }

    pub fn from_bits(bits: u64) -> Option<Self> {
        match bits {
            32 => Some(CounterWidth::Bits32),
            64 => Some(CounterWidth::Bits64),
            _ => None,
        }
    }
}

/// Unit of the derived rate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateUnit {
    /// Octet counter converted to bits per second
    BitsPerSecond,

    /// Event counter (errors, discards) per second
    PerSecond,
}

impl RateUnit {
    fn multiplier(self) -> f64 {
        match self {
            RateUnit::BitsPerSecond => 8.0,
            RateUnit::PerSecond => 1.0,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            RateUnit::BitsPerSecond => "bps",
            RateUnit::PerSecond => "per_second",
        }
    }
}

/// One reading of a counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterReading {
    pub value: u64,
    pub at: DateTime<Utc>,
}

impl CounterReading {
    pub fn new(value: u64, at: DateTime<Utc>) -> Self {
        Self { value, at }
    }
}

/// A derived rate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rate {
    pub value: f64,

    /// The counter went backwards implausibly fast for a wrap; the interval
    /// is reported as 0 and should be treated as a gap.
    pub discontinuous: bool,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RateError {
    #[error("current reading is not newer than the previous one")]
    InvalidOrdering,

    #[error("interval between readings is too small to derive a rate")]
    Indeterminate,
}

/// Derive a rate from two consecutive readings of the same counter.
///
/// `ceiling` is the highest rate (in output units) that is physically
/// plausible, e.g. the interface speed. A wrap that would imply more than
/// that is treated as a reset.
pub fn counter_rate(
    previous: CounterReading,
    current: CounterReading,
    width: CounterWidth,
    unit: RateUnit,
    ceiling: Option<f64>,
) -> Result<Rate, RateError> {
    if current.at <= previous.at {
        return Err(RateError::InvalidOrdering);
    }

    let elapsed_ms = (current.at - previous.at).num_milliseconds();
    if elapsed_ms <= 0 {
        return Err(RateError::Indeterminate);
    }
    let elapsed_secs = elapsed_ms as f64 / 1000.0;

    if current.value >= previous.value {
        let delta = current.value - previous.value;
        return Ok(Rate {
            value: delta as f64 * unit.multiplier() / elapsed_secs,
            discontinuous: false,
        });
    }

    // A previous value above the declared width cannot have wrapped at that width.
    let Some(headroom) = width.max_value().checked_sub(previous.value) else {
        return Ok(reset());
    };

    let delta = headroom as u128 + current.value as u128 + 1;
    let value = delta as f64 * unit.multiplier() / elapsed_secs;

    if ceiling.is_some_and(|ceiling| value > ceiling) {
        return Ok(reset());
    }

    Ok(Rate {
        value,
        discontinuous: false,
    })
}

fn reset() -> Rate {
    Rate {
        value: 0.0,
        discontinuous: true,
    }
}
