//! DispatcherBuilder: wiring and start-up validation.
//!
//! # Example
//! ```ignore
//! let dispatcher = DispatcherBuilder::new(EngineConfig::default())
//!     .codec(Arc::new(MyCodec))
//!     .build()?;
//! ```

use std::sync::Arc;

use super::bus::EventBus;
use super::config::EngineConfig;
use super::dispatcher::Dispatcher;
use super::registry::TaskRegistry;
use super::worker::CompressionWorker;
use crate::domain::SquashResult;
use crate::impls::ImageCodec;
use crate::ports::{Clock, Codec, IdGenerator, SystemClock, UlidGenerator};

pub struct DispatcherBuilder {
    config: EngineConfig,
    codec: Option<Arc<dyn Codec>>,
    clock: Arc<dyn Clock>,
}

impl DispatcherBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            codec: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the default [`ImageCodec`].
    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Clock for archive names and id timestamps.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validate the config and start the dispatcher.
    ///
    /// Fails fast with `SquashError::Config`. Must be called from within a
    /// tokio runtime, since it spawns the router task.
    pub fn build(self) -> SquashResult<Dispatcher> {
        self.config.validate()?;

        let codec = self
            .codec
            .unwrap_or_else(|| Arc::new(ImageCodec::new(&self.config.quality)));
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(Arc::clone(&self.clock)));
        let worker = CompressionWorker::new(
            codec,
            self.config.pacing.clone(),
            self.config.task_timeout(),
        );

        Ok(Dispatcher::start(
            self.config,
            TaskRegistry::new(Arc::clone(&ids)),
            EventBus::new(ids),
            worker,
            self.clock,
        ))
    }
}
