pub mod metrics;
pub mod tracing;

use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::types::JobsDbEvent;

pub use metrics::{JobsDbMetrics, MetricsSnapshot};

#[cfg(feature = "tracing-basic")]
pub use self::tracing::{init_json_tracing, init_tracing};

/// Event broadcast and counters shared by every component of an instance
#[derive(Clone)]
pub struct ObservabilityLayer {
    event_broadcaster: broadcast::Sender<JobsDbEvent>,
    metrics: Arc<JobsDbMetrics>,
}

impl ObservabilityLayer {
    pub fn new() -> Self {
        let (event_broadcaster, _) = broadcast::channel(10000);
        Self {
            event_broadcaster,
            metrics: Arc::new(JobsDbMetrics::new()),
        }
    }

    /// Publish an event; dropped silently when nobody listens
    pub fn emit(&self, event: JobsDbEvent) {
        ::tracing::trace!(event = event.event_name(), "jobsdb event");
        let _ = self.event_broadcaster.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobsDbEvent> {
        self.event_broadcaster.subscribe()
    }

    /// Events as a stream; lagged receivers skip what they missed
    pub fn event_stream(&self) -> impl futures_core::Stream<Item = JobsDbEvent> + Send + 'static {
        BroadcastStream::new(self.event_broadcaster.subscribe()).filter_map(|event| event.ok())
    }

    pub fn metrics(&self) -> &Arc<JobsDbMetrics> {
        &self.metrics
    }
}

impl Default for ObservabilityLayer {
    fn default() -> Self {
        Self::new()
    }
}
