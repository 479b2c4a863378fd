//! Sample sequencing on top of a [`PositionSource`].
//!
//! [`GeoSampler::start`] opens a subscription and hands back a [`Sampling`],
//! which is both the sample sequence and its cancellation handle. A sampler
//! can be started again after the previous `Sampling` was cancelled.

use crate::adapter::{PositionSample, PositionSource, PositionStream, SamplingOptions, SensorError};
use futures_util::StreamExt;
use geopresence_core::now_millis;
use std::sync::Arc;
use tokio::time::Instant;

#[derive(Clone)]
pub struct GeoSampler {
    source: Arc<dyn PositionSource>,
    options: SamplingOptions,
}

impl GeoSampler {
    pub fn new(source: Arc<dyn PositionSource>, options: SamplingOptions) -> Self {
        Self { source, options }
    }

    pub fn options(&self) -> &SamplingOptions {
        &self.options
    }

    /// Subscribe to the underlying source
    pub async fn start(&self) -> Result<Sampling, SensorError> {
        tracing::info!(
            "Starting position sampling from {} (high_accuracy={})",
            self.source.source_name(),
            self.options.high_accuracy
        );
        let stream = self.source.subscribe(&self.options).await?;
        Ok(Sampling::new(stream, self.options))
    }
}

/// An active subscription
pub struct Sampling {
    stream: Option<PositionStream>,
    options: SamplingOptions,
    deadline: Instant,
}

impl Sampling {
    fn new(stream: PositionStream, options: SamplingOptions) -> Self {
        Self {
            stream: Some(stream),
            options,
            deadline: Instant::now() + options.timeout,
        }
    }

    /// Wait for the next fresh sample.
    ///
    /// Returns `None` once cancelled or when the source has ended. A timeout is
    /// reported as an error and the wait starts over. The deadline survives the
    /// future being dropped, so this is safe to use inside `tokio::select!`.
    pub async fn next(&mut self) -> Option<Result<PositionSample, SensorError>> {
        loop {
            let stream = self.stream.as_mut()?;
            match tokio::time::timeout_at(self.deadline, stream.next()).await {
                Err(_) => {
                    self.deadline = Instant::now() + self.options.timeout;
                    return Some(Err(SensorError::Timeout(self.options.timeout)));
                }
                Ok(None) => {
                    tracing::info!("Position source ended");
                    self.stream = None;
                    return None;
                }
                Ok(Some(Err(e))) => return Some(Err(e)),
                Ok(Some(Ok(sample))) => {
                    let age_ms = now_millis().saturating_sub(sample.captured_at);
                    if age_ms > self.options.max_age.as_millis() as i64 {
                        tracing::debug!("Discarding position sample {}ms old", age_ms);
                        continue;
                    }
                    self.deadline = Instant::now() + self.options.timeout;
                    return Some(Ok(sample));
                }
            }
        }
    }

    /// Stop the subscription. Safe to call repeatedly.
    pub fn cancel(&mut self) {
        if self.stream.take().is_some() {
            tracing::info!("Position sampling stopped");
        }
    }

    pub fn is_active(&self) -> bool {
        self.stream.is_some()
    }
}

impl Drop for Sampling {
    fn drop(&mut self) {
        self.cancel();
    }
}
