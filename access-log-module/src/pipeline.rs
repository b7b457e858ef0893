// Copyright 2024 Wladimir Palant
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The started pipeline events are dispatched to

use log::trace;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::ConfigError;
use crate::event::AccessEvent;
use crate::filter::{chain_decision, Filter, FilterReply};
use crate::sink::Sink;
use crate::status::StatusManager;

/// Shared reference to a started pipeline
pub type PipelineHandle = Arc<Pipeline>;

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// Mutable state while a configurator sets up a pipeline
///
/// Once the configurator is done, [`PipelineContext::start`] starts all sinks and produces the
/// immutable [`Pipeline`].
#[derive(Debug)]
pub struct PipelineContext {
    name: String,
    sinks: Vec<Arc<dyn Sink>>,
    filters: Vec<Arc<dyn Filter>>,
    sequence_numbers: bool,
    status: Arc<StatusManager>,
}

impl PipelineContext {
    /// Creates an empty context for the configuration resource `name`
    pub fn new(name: impl Into<String>, debug: bool) -> Self {
        Self {
            name: name.into(),
            sinks: Vec::new(),
            filters: Vec::new(),
            sequence_numbers: false,
            status: Arc::new(StatusManager::new(debug)),
        }
    }

    /// Name of the configuration resource
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds a sink, names have to be unique.
    pub fn add_sink(&mut self, sink: Arc<dyn Sink>) -> Result<(), ConfigError> {
        if self.sinks.iter().any(|s| s.name() == sink.name()) {
            return Err(ConfigError::parse(
                &self.name,
                format!("duplicate sink name {}", sink.name()),
            ));
        }
        self.status
            .info("context", format!("Adding sink {}", sink.name()));
        self.sinks.push(sink);
        Ok(())
    }

    /// Appends a filter to the filter chain
    pub fn add_filter(&mut self, filter: Arc<dyn Filter>) {
        self.status
            .info("context", format!("Adding filter {filter:?}"));
        self.filters.push(filter);
    }

    /// Enables or disables sequence numbers for events
    pub fn set_sequence_numbers(&mut self, enabled: bool) {
        self.sequence_numbers = enabled;
    }

    /// Diagnostics of this pipeline
    pub fn status(&self) -> &StatusManager {
        &self.status
    }

    /// Starts all sinks in order. If any sink fails to start, the sinks started before are
    /// stopped again.
    pub fn start(self) -> Result<Pipeline, ConfigError> {
        if self.sinks.is_empty() {
            self.status.error("context", "No sinks configured");
            return Err(ConfigError::activation(&self.name, "no sinks configured"));
        }

        for (index, sink) in self.sinks.iter().enumerate() {
            if let Err(err) = sink.start() {
                self.status
                    .error("context", format!("Failed starting sink: {err}"));
                for started in &self.sinks[..index] {
                    started.stop();
                }
                return Err(ConfigError::activation(&self.name, err));
            }
        }

        self.status.info(
            "context",
            format!("Pipeline {} started with {} sink(s)", self.name, self.sinks.len()),
        );

        Ok(Pipeline {
            name: self.name,
            sinks: self.sinks,
            filters: self.filters,
            sequence: self.sequence_numbers.then(|| AtomicU64::new(0)),
            started: AtomicBool::new(true),
            status: self.status,
        })
    }
}

/// A started pipeline: filter chain and sinks in dispatch order
#[derive(Debug)]
pub struct Pipeline {
    name: String,
    sinks: Vec<Arc<dyn Sink>>,
    filters: Vec<Arc<dyn Filter>>,
    sequence: Option<AtomicU64>,
    started: AtomicBool,
    status: Arc<StatusManager>,
}

impl Pipeline {
    /// Name of the configuration resource this pipeline was loaded from
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `false` once the pipeline has been stopped
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// All sinks in dispatch order
    pub fn sinks(&self) -> &[Arc<dyn Sink>] {
        &self.sinks
    }

    /// Looks up a sink by its name
    pub fn sink(&self, name: &str) -> Option<&Arc<dyn Sink>> {
        self.sinks.iter().find(|sink| sink.name() == name)
    }

    /// Looks up a sink by its name and type
    ///
    /// ```rust
    /// use access_log_module::{CaptureSink, Pipeline};
    ///
    /// fn captured(pipeline: &Pipeline) -> usize {
    ///     pipeline
    ///         .sink_as::<CaptureSink>("CAPTURE")
    ///         .map(CaptureSink::len)
    ///         .unwrap_or(0)
    /// }
    /// ```
    pub fn sink_as<T: Sink + 'static>(&self, name: &str) -> Option<&T> {
        self.sink(name)?.as_any().downcast_ref()
    }

    /// Diagnostics of this pipeline
    pub fn status(&self) -> &StatusManager {
        &self.status
    }

    /// Next sequence number, always `0` if numbering is disabled
    pub fn next_sequence_number(&self) -> u64 {
        self.sequence
            .as_ref()
            .map(|sequence| sequence.fetch_add(1, Ordering::Relaxed) + 1)
            .unwrap_or(0)
    }

    /// Runs the filter chain on an event
    pub fn filter_decision(&self, event: &AccessEvent) -> FilterReply {
        chain_decision(&self.filters, event)
    }

    /// Hands the event to every sink in order and returns the number of sinks that accepted it.
    ///
    /// Errors and panics of a sink are recorded as statuses, the remaining sinks still get the
    /// event.
    pub fn dispatch(&self, event: &AccessEvent) -> usize {
        let mut delivered = 0;
        for sink in &self.sinks {
            match catch_unwind(AssertUnwindSafe(|| sink.append(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(err)) => self.status.warn("dispatch", err.to_string()),
                Err(panic) => self.status.error(
                    "dispatch",
                    format!("Sink {} panicked: {}", sink.name(), panic_message(&*panic)),
                ),
            }
        }
        trace!("Access event delivered to {delivered} sink(s)");
        delivered
    }

    /// Stops the pipeline and all its sinks. Later exchanges are ignored, queued events are still
    /// written.
    pub fn stop(&self) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }

        for sink in &self.sinks {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| sink.stop())) {
                self.status.error(
                    "pipeline",
                    format!(
                        "Failed stopping sink {}: {}",
                        sink.name(),
                        panic_message(&*panic)
                    ),
                );
            }
        }
        self.status
            .info("pipeline", format!("Pipeline {} stopped", self.name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    use crate::configuration::LogField;
    use crate::sink::{CaptureSink, SinkError};
    use crate::status::StatusLevel;
    use crate::test_utils::{StalledWriter, TestExchange};
    use crate::writer::WriterSink;

    #[derive(Debug)]
    struct BrokenSink;

    impl Sink for BrokenSink {
        fn name(&self) -> &str {
            "BROKEN"
        }

        fn start(&self) -> Result<(), SinkError> {
            Err(SinkError::Failed {
                name: "BROKEN".to_owned(),
                message: "cannot start".to_owned(),
            })
        }

        fn append(&self, _event: &AccessEvent) -> Result<(), SinkError> {
            unreachable!()
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn event() -> AccessEvent {
        let exchange = TestExchange::get("/").with_response(200, "text/plain", 2);
        AccessEvent::capture(&exchange, &exchange, exchange.start, 0)
    }

    #[test]
    fn no_sinks() {
        let context = PipelineContext::new("empty", false);
        assert!(matches!(
            context.start(),
            Err(ConfigError::ActivationFailure { .. })
        ));
    }

    #[test]
    fn duplicate_sink() {
        let mut context = PipelineContext::new("duplicate", false);
        context.add_sink(Arc::new(CaptureSink::new("A"))).unwrap();
        assert!(matches!(
            context.add_sink(Arc::new(CaptureSink::new("A"))),
            Err(ConfigError::ParseFailure { .. })
        ));
    }

    #[test]
    fn start_failure() {
        let mut context = PipelineContext::new("broken", false);
        context.add_sink(Arc::new(CaptureSink::new("A"))).unwrap();
        context.add_sink(Arc::new(BrokenSink)).unwrap();
        let err = context.start().unwrap_err();
        assert!(err.to_string().contains("cannot start"));
    }

    #[test]
    fn lookup_and_dispatch() {
        let mut context = PipelineContext::new("test", false);
        context.add_sink(Arc::new(CaptureSink::new("A"))).unwrap();
        context.add_sink(Arc::new(CaptureSink::new("B"))).unwrap();
        let pipeline = context.start().unwrap();

        assert_eq!(pipeline.name(), "test");
        assert!(pipeline.is_started());
        assert_eq!(pipeline.sinks().len(), 2);
        assert!(pipeline.sink("C").is_none());
        assert!(pipeline.sink_as::<BrokenSink>("A").is_none());

        assert_eq!(pipeline.dispatch(&event()), 2);
        assert_eq!(pipeline.sink_as::<CaptureSink>("A").unwrap().len(), 1);
        assert_eq!(pipeline.sink_as::<CaptureSink>("B").unwrap().len(), 1);

        pipeline.stop();
        assert!(!pipeline.is_started());
        pipeline.stop();
    }

    #[test]
    fn full_queue_doesnt_block_other_sinks() {
        let slow = Arc::new(WriterSink::console("SLOW", vec![LogField::Status], 1));
        let (writer, control) = StalledWriter::new();
        slow.start_with_writer(Box::new(writer)).unwrap();

        let mut context = PipelineContext::new("test", false);
        context.add_sink(slow).unwrap();
        context.add_sink(Arc::new(CaptureSink::new("A"))).unwrap();
        let pipeline = context.start().unwrap();

        assert_eq!(pipeline.dispatch(&event()), 2);
        control.wait_until_stalled();
        assert_eq!(pipeline.dispatch(&event()), 2);
        assert_eq!(pipeline.dispatch(&event()), 1);
        assert_eq!(pipeline.dispatch(&event()), 1);

        assert_eq!(pipeline.sink_as::<CaptureSink>("A").unwrap().len(), 4);
        let warnings: Vec<_> = pipeline
            .status()
            .statuses()
            .into_iter()
            .filter(|status| status.level == StatusLevel::Warn)
            .collect();
        assert_eq!(warnings.len(), 2);
        assert!(warnings
            .iter()
            .all(|status| status.message == "queue of sink SLOW is full, event dropped"));

        control.release();
        pipeline.stop();
        assert_eq!(control.output(), "200\n200\n");
    }

    #[test]
    fn sequence_numbers() {
        let mut context = PipelineContext::new("test", false);
        context.add_sink(Arc::new(CaptureSink::new("A"))).unwrap();
        let pipeline = context.start().unwrap();
        assert_eq!(pipeline.next_sequence_number(), 0);
        assert_eq!(pipeline.next_sequence_number(), 0);

        let mut context = PipelineContext::new("test", false);
        context.add_sink(Arc::new(CaptureSink::new("A"))).unwrap();
        context.set_sequence_numbers(true);
        let pipeline = context.start().unwrap();
        assert_eq!(pipeline.next_sequence_number(), 1);
        assert_eq!(pipeline.next_sequence_number(), 2);
    }
}
