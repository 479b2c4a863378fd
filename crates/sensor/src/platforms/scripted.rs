// Scripted Position Source
//
// Emits a predetermined sequence of positions. Backs the `fixed` source kind
// and stands in for real hardware in tests and demos.

use crate::adapter::{PositionSample, PositionSource, PositionStream, SamplingOptions, SensorError};
use async_trait::async_trait;
use geopresence_core::Coordinate;
use std::time::Duration;

#[derive(Debug, Clone)]
enum Script {
    /// Walk the points at a fixed period; loop forever when `repeat` is set
    Track {
        points: Vec<Coordinate>,
        interval: Duration,
        repeat: bool,
    },
    /// Pre-stamped samples emitted back to back, then end
    Samples(Vec<PositionSample>),
    /// Never emits anything
    Silent,
    /// Subscription is refused
    Fail(SensorError),
}

#[derive(Debug, Clone)]
pub struct ScriptedSource {
    script: Script,
}

impl ScriptedSource {
    /// Re-emit one coordinate every `interval`, forever
    pub fn fixed(point: Coordinate, interval: Duration) -> Self {
        Self {
            script: Script::Track {
                points: vec![point],
                interval,
                repeat: true,
            },
        }
    }

    /// Walk a track once, one point per `interval`
    pub fn track(points: Vec<Coordinate>, interval: Duration) -> Self {
        Self {
            script: Script::Track {
                points,
                interval,
                repeat: false,
            },
        }
    }

    pub fn samples(samples: Vec<PositionSample>) -> Self {
        Self {
            script: Script::Samples(samples),
        }
    }

    pub fn silent() -> Self {
        Self {
            script: Script::Silent,
        }
    }

    pub fn failing(error: SensorError) -> Self {
        Self {
            script: Script::Fail(error),
        }
    }
}

#[async_trait]
impl PositionSource for ScriptedSource {
    fn source_name(&self) -> &str {
        match self.script {
            Script::Track { repeat: true, .. } => "fixed",
            _ => "scripted",
        }
    }

    async fn subscribe(&self, _options: &SamplingOptions) -> Result<PositionStream, SensorError> {
        match &self.script {
            Script::Fail(error) => Err(error.clone()),
            Script::Silent => Ok(Box::pin(futures_util::stream::pending::<
                Result<PositionSample, SensorError>,
            >())),
            Script::Samples(samples) => {
                let samples = samples.clone().into_iter().map(Ok::<_, SensorError>);
                Ok(Box::pin(futures_util::stream::iter(samples)))
            }
            Script::Track {
                points,
                interval,
                repeat,
            } => {
                if points.is_empty() {
                    return Err(SensorError::Unavailable("empty track".to_string()));
                }
                let points = points.clone();
                let interval = *interval;
                let repeat = *repeat;

                let stream = async_stream::stream! {
                    let mut ticker = tokio::time::interval(interval);
                    loop {
                        for point in &points {
                            ticker.tick().await;
                            yield Ok::<_, SensorError>(PositionSample::now(*point));
                        }
                        if !repeat {
                            break;
                        }
                    }
                };
                Ok(Box::pin(stream))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn test_track_plays_once_in_order() {
        let a = Coordinate::new(1.0, 1.0).unwrap();
        let b = Coordinate::new(2.0, 2.0).unwrap();
        let source = ScriptedSource::track(vec![a, b], Duration::from_millis(1));

        let stream = source.subscribe(&SamplingOptions::default()).await.unwrap();
        let emitted: Vec<_> = stream.map(|s| s.unwrap().coordinate).collect().await;
        assert_eq!(emitted, vec![a, b]);
    }

    #[tokio::test]
    async fn test_empty_track_is_unavailable() {
        let source = ScriptedSource::track(vec![], Duration::from_millis(1));
        assert!(matches!(
            source.subscribe(&SamplingOptions::default()).await,
            Err(SensorError::Unavailable(_))
        ));
    }
}
