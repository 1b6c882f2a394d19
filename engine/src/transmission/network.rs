//! Network state and bandwidth estimation.

use serde::{Deserialize, Serialize};

/// Connection quality tier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum NetworkQuality {
    Offline,
    Poor,
    Fair,
    #[default]
    Good,
    Excellent,
}

impl NetworkQuality {
    /// Tier for a measured bandwidth (bytes per second) and round trip time.
    pub fn from_measurements(bandwidth_bps: u64, rtt_ms: u64) -> Self {
        match (bandwidth_bps, rtt_ms) {
            (0, _) => NetworkQuality::Offline,
            (bw, rtt) if bw >= 1_000_000 && rtt <= 100 => NetworkQuality::Excellent,
            (bw, rtt) if bw >= 250_000 && rtt <= 300 => NetworkQuality::Good,
            (bw, rtt) if bw >= 50_000 && rtt <= 1_000 => NetworkQuality::Fair,
            _ => NetworkQuality::Poor,
        }
    }

    /// Largest batch allowed at this tier.
    pub fn batch_limit(self, max_batch_size: usize) -> usize {
        let max = max_batch_size.max(1);
        match self {
            NetworkQuality::Offline => 0,
            NetworkQuality::Poor => 1,
            NetworkQuality::Fair => (max / 4).max(1),
            NetworkQuality::Good => (max / 2).max(1),
            NetworkQuality::Excellent => max,
        }
    }

    /// Whether payloads are compressed regardless of size.
    pub fn forces_compression(self) -> bool {
        matches!(self, NetworkQuality::Poor | NetworkQuality::Fair)
    }
}

impl std::fmt::Display for NetworkQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NetworkQuality::Offline => "offline",
            NetworkQuality::Poor => "poor",
            NetworkQuality::Fair => "fair",
            NetworkQuality::Good => "good",
            NetworkQuality::Excellent => "excellent",
        };
        f.write_str(name)
    }
}

/// Sampled or estimated network conditions. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkState {
    pub online: bool,
    pub quality: NetworkQuality,
    /// Bytes per second
    pub bandwidth_bps: u64,
    pub rtt_ms: u64,
    /// Share of the estimated bandwidth currently admitted, in [0, 1]
    pub utilization: f64,
}

impl Default for NetworkState {
    fn default() -> Self {
        Self {
            online: true,
            quality: NetworkQuality::Good,
            bandwidth_bps: 1_000_000,
            rtt_ms: 100,
            utilization: 0.0,
        }
    }
}

impl NetworkState {
    pub fn offline() -> Self {
        Self {
            online: false,
            quality: NetworkQuality::Offline,
            ..Self::default()
        }
    }

    /// Online state at the given tier.
    pub fn with_quality(quality: NetworkQuality) -> Self {
        Self {
            online: quality != NetworkQuality::Offline,
            quality,
            ..Self::default()
        }
    }
}

/// EWMA estimate of throughput and round trip time.
///
/// An external [`NetworkState`] sample pins the quality tier until the next
/// sample; transfer measurements keep refining bandwidth and RTT meanwhile.
#[derive(Debug, Clone)]
pub struct BandwidthEstimator {
    smoothing: f64,
    bandwidth_bps: f64,
    rtt_ms: f64,
    online: bool,
    pinned: Option<NetworkQuality>,
    samples: u64,
}

impl BandwidthEstimator {
    pub fn new(initial_bandwidth_bps: u64, smoothing: f64) -> Self {
        Self {
            smoothing: smoothing.clamp(f64::EPSILON, 1.0),
            bandwidth_bps: initial_bandwidth_bps as f64,
            rtt_ms: NetworkState::default().rtt_ms as f64,
            online: true,
            pinned: None,
            samples: 0,
        }
    }

    /// Fold in one completed transfer.
    pub fn record_transfer(&mut self, bytes: u64, duration_ms: u64) {
        let duration_ms = duration_ms.max(1);
        let throughput = bytes as f64 * 1_000.0 / duration_ms as f64;
        let a = self.smoothing;
        self.bandwidth_bps = a * throughput + (1.0 - a) * self.bandwidth_bps;
        self.rtt_ms = a * duration_ms as f64 + (1.0 - a) * self.rtt_ms;
        self.samples += 1;
    }

    /// Take an externally observed state.
    pub fn apply(&mut self, state: &NetworkState) {
        self.online = state.online;
        self.bandwidth_bps = state.bandwidth_bps as f64;
        self.rtt_ms = state.rtt_ms as f64;
        self.pinned = Some(state.quality);
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn bandwidth_bps(&self) -> u64 {
        self.bandwidth_bps.round() as u64
    }

    pub fn rtt_ms(&self) -> u64 {
        self.rtt_ms.round() as u64
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn quality(&self) -> NetworkQuality {
        if !self.online {
            return NetworkQuality::Offline;
        }
        self.pinned.unwrap_or_else(|| {
            NetworkQuality::from_measurements(self.bandwidth_bps(), self.rtt_ms())
        })
    }

    /// Current state with the given utilization.
    pub fn state(&self, utilization: f64) -> NetworkState {
        NetworkState {
            online: self.online,
            quality: self.quality(),
            bandwidth_bps: self.bandwidth_bps(),
            rtt_ms: self.rtt_ms(),
            utilization: utilization.clamp(0.0, 1.0),
        }
    }
}
