// Position Source Interface
//
// Defines the unified interface for all position-sampling backends.

use async_trait::async_trait;
use geopresence_core::{now_millis, Coordinate, SamplingConfig};
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// One position fix
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionSample {
    pub coordinate: Coordinate,
    /// When the fix was captured (epoch milliseconds)
    pub captured_at: i64,
}

impl PositionSample {
    /// A sample captured right now
    pub fn now(coordinate: Coordinate) -> Self {
        Self {
            coordinate,
            captured_at: now_millis(),
        }
    }
}

/// Subscription options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingOptions {
    pub high_accuracy: bool,
    pub max_age: Duration,
    pub timeout: Duration,
}

impl Default for SamplingOptions {
    fn default() -> Self {
        Self::from(&SamplingConfig::default())
    }
}

impl From<&SamplingConfig> for SamplingOptions {
    fn from(config: &SamplingConfig) -> Self {
        Self {
            high_accuracy: config.high_accuracy,
            max_age: Duration::from_millis(config.max_age_ms),
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }
}

/// Sensor error type
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SensorError {
    #[error("position source unavailable: {0}")]
    Unavailable(String),
    #[error("position access denied")]
    PermissionDenied,
    #[error("no position within {0:?}")]
    Timeout(Duration),
}

pub type PositionStream =
    Pin<Box<dyn futures_util::stream::Stream<Item = Result<PositionSample, SensorError>> + Send>>;

/// Unified position source trait
#[async_trait]
pub trait PositionSource: Send + Sync {
    /// Source name (e.g., "gpsd", "fixed")
    fn source_name(&self) -> &str;

    /// Open a subscription. Dropping the returned stream ends it.
    async fn subscribe(&self, options: &SamplingOptions) -> Result<PositionStream, SensorError>;
}
