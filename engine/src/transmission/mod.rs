//! Network-aware transmission.
//!
//! [`TransmissionScheduler`] decides what goes on the wire next and how it
//! is grouped; [`BandwidthEstimator`] tracks what the connection can take.

pub mod network;
pub mod scheduler;

pub use network::{BandwidthEstimator, NetworkQuality, NetworkState};
pub use scheduler::{
    Admission, Batch, Dispatch, RequestId, SubmitOptions, SubmitReceipt, TransmissionRequest,
    TransmissionScheduler, TransmissionStats,
};
