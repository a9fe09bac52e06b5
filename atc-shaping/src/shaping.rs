//! Shaping profiles.

use serde::{Deserialize, Serialize};

/// The profile applied to a group: independent settings for each direction.
///
/// `up` is enforced on the WAN interface, `down` on the LAN interface. A missing direction is
/// left unshaped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Shaping {
    /// Traffic leaving the clients.
    pub up: Option<LinkShaping>,
    /// Traffic towards the clients.
    pub down: Option<LinkShaping>,
}

/// Network conditions for one direction of a link.
///
/// # Example
///
/// ```
/// use atc_shaping::{Delay, LinkShaping, Loss};
///
/// // A slow, lossy 3G-like uplink.
/// let link = LinkShaping {
///     rate: 780,
///     delay: Delay { delay: 100, jitter: 10, correlation: 0.0 },
///     loss: Loss { percentage: 1.5, correlation: 0.0 },
///     ..Default::default()
/// };
/// assert_eq!(link.reorder.gap, 0);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkShaping {
    /// Bandwidth cap in kbit/s. Zero means unlimited.
    pub rate: u64,
    /// Added latency.
    pub delay: Delay,
    /// Random packet loss.
    pub loss: Loss,
    /// Out-of-order delivery.
    pub reorder: Reorder,
    /// Single-bit corruption.
    pub corruption: Corruption,
}

/// Added latency.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Delay {
    /// Base delay in milliseconds.
    pub delay: u32,
    /// Random variation around `delay`, in milliseconds.
    pub jitter: u32,
    /// Correlation with the previous packet's jitter, in percent.
    pub correlation: f64,
}

/// Random packet loss.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Loss {
    /// Probability per packet, in percent.
    pub percentage: f64,
    /// Correlation with the previous packet, in percent.
    pub correlation: f64,
}

/// Out-of-order delivery. Only takes effect together with a delay.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Reorder {
    /// Probability per packet, in percent.
    pub percentage: f64,
    /// Every `gap`-th packet is a reorder candidate.
    pub gap: u32,
    /// Correlation with the previous packet, in percent.
    pub correlation: f64,
}

/// Random single-bit errors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Corruption {
    /// Probability per packet, in percent.
    pub percentage: f64,
    /// Correlation with the previous packet, in percent.
    pub correlation: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_default() {
        let shaping: Shaping =
            serde_json::from_str(r#"{"up": {"rate": 100, "loss": {"percentage": 2.5}}}"#).unwrap();

        let up = shaping.up.unwrap();
        assert_eq!(up.rate, 100);
        assert_eq!(up.loss, Loss { percentage: 2.5, correlation: 0.0 });
        assert_eq!(up.delay, Delay::default());
        assert!(shaping.down.is_none());
    }
}
