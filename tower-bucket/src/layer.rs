use tower::Layer;

use crate::config::SchedulerConfig;
use crate::service::Scheduler;

/// Wraps a transport in a [`Scheduler`].
///
/// Each call to [`layer`](Layer::layer) creates a scheduler with its own
/// buckets and global lock; clone the resulting service to share them.
#[derive(Clone, Debug, Default)]
pub struct SchedulerLayer {
    config: SchedulerConfig,
}

impl SchedulerLayer {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }
}

impl<T> Layer<T> for SchedulerLayer {
    type Service = Scheduler<T>;

    fn layer(&self, transport: T) -> Self::Service {
        Scheduler::new(transport, self.config.clone())
    }
}
