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

//! The bridge turning completed exchanges into events for the pipeline

use log::trace;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use crate::configuration::AccessLogConf;
use crate::error::ConfigError;
use crate::event::AccessEvent;
use crate::filter::FilterReply;
use crate::loader::{ConfigurationLoader, Configurator, ResourceSource, YamlConfigurator};
use crate::pipeline::{panic_message, PipelineHandle};
use crate::view::{RequestCompletionHook, RequestView, ResponseView};

/// Builds an [`AccessEvent`] for every completed exchange and dispatches it to the pipeline
///
/// The bridge keeps no per-exchange state and can be called concurrently from any number of
/// server threads. Cloning it is cheap, clones share the pipeline.
#[derive(Debug, Clone)]
pub struct AccessLogBridge {
    pipeline: PipelineHandle,
    ignoring: Arc<AtomicBool>,
}

impl AccessLogBridge {
    /// Creates a bridge for an already started pipeline
    pub fn new(pipeline: PipelineHandle) -> Self {
        Self {
            pipeline,
            ignoring: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Loads a configuration via the loader and creates a bridge for the resulting pipeline
    pub fn load(
        loader: &ConfigurationLoader,
        source: impl Into<ResourceSource>,
        configurator: &dyn Configurator,
        allow_reuse: bool,
    ) -> Result<Self, ConfigError> {
        loader
            .load(source, configurator, allow_reuse)
            .map(Self::new)
    }

    /// Sets up the bridge described by the server configuration, `None` if access logging is
    /// disabled.
    ///
    /// Without an explicitly configured resource the default discovery applies, see
    /// [`ResourceSource::discover`].
    pub fn from_conf(
        loader: &ConfigurationLoader,
        conf: &AccessLogConf,
    ) -> Result<Option<Self>, ConfigError> {
        if !conf.enabled {
            return Ok(None);
        }

        let source = match &conf.config {
            Some(config) => ResourceSource::from(config.as_str()),
            None => ResourceSource::discover(loader.resource_dirs())?.into(),
        };
        Self::load(loader, source, &YamlConfigurator, conf.allow_reuse).map(Some)
    }

    /// The pipeline events are dispatched to
    pub fn pipeline(&self) -> &PipelineHandle {
        &self.pipeline
    }

    /// Records a completed exchange.
    ///
    /// The event is run through the filter chain and handed to all sinks. This never fails or
    /// panics, problems are recorded in the pipeline’s status manager instead. Exchanges
    /// completing after the pipeline was stopped are ignored.
    pub fn on_exchange_complete(&self, request: &dyn RequestView, response: &dyn ResponseView) {
        let pipeline = &self.pipeline;
        if !pipeline.is_started() {
            if !self.ignoring.swap(true, Ordering::Relaxed) {
                pipeline.status().info(
                    "bridge",
                    format!(
                        "Pipeline {} stopped, ignoring further exchanges",
                        pipeline.name()
                    ),
                );
            }
            return;
        }

        let result = catch_unwind(AssertUnwindSafe(|| {
            let event = AccessEvent::capture(
                request,
                response,
                SystemTime::now(),
                pipeline.next_sequence_number(),
            );
            if pipeline.filter_decision(&event) == FilterReply::Deny {
                trace!("Access event for {} denied by filter", event.request_uri());
                return;
            }
            pipeline.dispatch(&event);
        }));

        if let Err(panic) = result {
            pipeline.status().error(
                "bridge",
                format!("Failed processing exchange: {}", panic_message(&*panic)),
            );
        }
    }
}

impl RequestCompletionHook for AccessLogBridge {
    fn on_exchange_complete(&self, request: &dyn RequestView, response: &dyn ResponseView) {
        AccessLogBridge::on_exchange_complete(self, request, response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::any::Any;
    use std::sync::Arc;
    use test_log::test;

    use crate::event::{Endpoint, Headers};
    use crate::loader::Resource;
    use crate::pipeline::PipelineContext;
    use crate::sink::{CaptureSink, Sink, SinkError};
    use crate::status::StatusLevel;
    use crate::test_utils::TestExchange;

    #[derive(Debug)]
    struct FailingSink {
        panic: bool,
    }

    impl Sink for FailingSink {
        fn name(&self) -> &str {
            if self.panic {
                "PANIC"
            } else {
                "FAIL"
            }
        }

        fn append(&self, _event: &AccessEvent) -> Result<(), SinkError> {
            if self.panic {
                panic!("sink exploded");
            }
            Err(SinkError::Failed {
                name: self.name().to_owned(),
                message: "disk full".to_owned(),
            })
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    /// A request view that cannot produce its headers
    struct BrokenRequest(TestExchange);

    impl RequestView for BrokenRequest {
        fn start_time(&self) -> SystemTime {
            self.0.start_time()
        }
        fn method(&self) -> &str {
            self.0.method()
        }
        fn uri(&self) -> &str {
            self.0.uri()
        }
        fn protocol(&self) -> &str {
            self.0.protocol()
        }
        fn request_headers(&self) -> Headers {
            panic!("connection reset");
        }
        fn remote_addr(&self) -> Option<Endpoint> {
            self.0.remote_addr()
        }
        fn local_addr(&self) -> Option<Endpoint> {
            self.0.local_addr()
        }
    }

    fn capture_pipeline(sinks: Vec<Arc<dyn Sink>>) -> PipelineHandle {
        let mut context = PipelineContext::new("test", false);
        for sink in sinks {
            context.add_sink(sink).unwrap();
        }
        Arc::new(context.start().unwrap())
    }

    fn captured(bridge: &AccessLogBridge, name: &str) -> Vec<AccessEvent> {
        bridge
            .pipeline()
            .sink_as::<CaptureSink>(name)
            .unwrap()
            .events()
    }

    #[test]
    fn single_exchange() {
        let bridge = AccessLogBridge::new(capture_pipeline(vec![Arc::new(CaptureSink::new(
            "CAPTURE",
        ))]));

        let exchange = TestExchange::get("/test?a=1")
            .with_request_header("User-Agent", "test")
            .with_response(200, "text/plain", 4);
        bridge.on_exchange_complete(&exchange, &exchange);

        let events = captured(&bridge, "CAPTURE");
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.request_uri(), "/test?a=1");
        assert_eq!(event.method(), "GET");
        assert_eq!(event.status(), 200);
        assert_eq!(event.content_length(), 4);
        assert_eq!(event.request_header("user-agent"), Some("test"));
        assert_eq!(event.timestamp(), exchange.start);
    }

    #[test]
    fn aborted_exchange() {
        let bridge = AccessLogBridge::new(capture_pipeline(vec![Arc::new(CaptureSink::new(
            "CAPTURE",
        ))]));

        let exchange = TestExchange::get("/aborted");
        bridge.on_exchange_complete(&exchange, &exchange);

        let events = captured(&bridge, "CAPTURE");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status(), 0);
        assert_eq!(events[0].content_length(), 0);
    }

    #[test]
    fn failing_sinks_isolated() {
        let bridge = AccessLogBridge::new(capture_pipeline(vec![
            Arc::new(FailingSink { panic: false }),
            Arc::new(FailingSink { panic: true }),
            Arc::new(CaptureSink::new("CAPTURE")),
        ]));

        let exchange = TestExchange::get("/").with_response(204, "text/plain", 0);
        bridge.on_exchange_complete(&exchange, &exchange);
        bridge.on_exchange_complete(&exchange, &exchange);

        assert_eq!(captured(&bridge, "CAPTURE").len(), 2);
        let status = bridge.pipeline().status();
        assert_eq!(status.highest_level(), Some(StatusLevel::Error));
        let statuses = status.statuses();
        assert!(statuses.iter().any(|s| s.message.contains("disk full")));
        assert!(statuses.iter().any(|s| s.message.contains("sink exploded")));
    }

    #[test]
    fn broken_view() {
        let bridge = AccessLogBridge::new(capture_pipeline(vec![Arc::new(CaptureSink::new(
            "CAPTURE",
        ))]));

        let exchange = TestExchange::get("/");
        bridge.on_exchange_complete(&BrokenRequest(exchange.clone()), &exchange);
        assert!(captured(&bridge, "CAPTURE").is_empty());
        assert!(bridge
            .pipeline()
            .status()
            .statuses()
            .iter()
            .any(|s| s.message.contains("connection reset")));

        // Bridge keeps working afterwards
        bridge.on_exchange_complete(&exchange, &exchange);
        assert_eq!(captured(&bridge, "CAPTURE").len(), 1);
    }

    #[test]
    fn concurrent_exchanges() {
        let bridge = AccessLogBridge::new(capture_pipeline(vec![Arc::new(CaptureSink::new(
            "CAPTURE",
        ))]));

        std::thread::scope(|scope| {
            for i in 0..100 {
                let bridge = bridge.clone();
                scope.spawn(move || {
                    let exchange = TestExchange::get(&format!("/item/{i}"))
                        .with_request_header("X-Request", &i.to_string())
                        .with_response(200, "text/plain", i);
                    bridge.on_exchange_complete(&exchange, &exchange);
                });
            }
        });

        let events = captured(&bridge, "CAPTURE");
        assert_eq!(events.len(), 100);
        for event in &events {
            let i = event.request_header("x-request").unwrap();
            assert_eq!(event.request_uri(), format!("/item/{i}"));
            assert_eq!(event.content_length().to_string(), i);
        }
        let mut uris: Vec<_> = events.iter().map(|e| e.request_uri().to_owned()).collect();
        uris.sort();
        uris.dedup();
        assert_eq!(uris.len(), 100);
    }

    #[test]
    fn stopped_pipeline() {
        let bridge = AccessLogBridge::new(capture_pipeline(vec![Arc::new(CaptureSink::new(
            "CAPTURE",
        ))]));

        let exchange = TestExchange::get("/");
        bridge.on_exchange_complete(&exchange, &exchange);
        bridge.pipeline().stop();
        bridge.on_exchange_complete(&exchange, &exchange);
        bridge
            .clone()
            .on_exchange_complete(&BrokenRequest(exchange.clone()), &exchange);
        assert_eq!(captured(&bridge, "CAPTURE").len(), 1);

        let messages: Vec<_> = bridge
            .pipeline()
            .status()
            .statuses()
            .into_iter()
            .filter(|status| status.origin == "bridge")
            .map(|status| (status.level, status.message))
            .collect();
        assert_eq!(
            messages,
            vec![(
                StatusLevel::Info,
                "Pipeline test stopped, ignoring further exchanges".to_owned()
            )]
        );
    }

    #[test]
    fn filters_and_sequence() {
        let loader = ConfigurationLoader::new();
        let bridge = AccessLogBridge::load(
            &loader,
            Resource::inline(
                "filtered",
                r#"
                    sequence_number: true
                    filters:
                      - type: path_prefix
                        prefixes: [/health]
                        on_match: deny
                    sinks:
                      - type: capture
                        name: CAPTURE
                "#,
            ),
            &YamlConfigurator,
            true,
        )
        .unwrap();

        for uri in ["/", "/health", "/other"] {
            let exchange = TestExchange::get(uri).with_response(200, "text/plain", 0);
            bridge.on_exchange_complete(&exchange, &exchange);
        }

        let events = captured(&bridge, "CAPTURE");
        let uris: Vec<_> = events.iter().map(AccessEvent::request_uri).collect();
        assert_eq!(uris, vec!["/", "/other"]);
        let numbers: Vec<_> = events.iter().map(AccessEvent::sequence_number).collect();
        assert_eq!(numbers, vec![1, 3]);
    }

    #[test]
    fn completion_hook() {
        let bridge = AccessLogBridge::new(capture_pipeline(vec![Arc::new(CaptureSink::new(
            "CAPTURE",
        ))]));

        let hooks: Vec<Box<dyn RequestCompletionHook>> = vec![
            Box::new(bridge.clone()),
            Box::new(|request: &dyn RequestView, _: &dyn ResponseView| {
                assert_eq!(request.uri(), "/hook");
            }),
        ];
        let exchange = TestExchange::get("/hook");
        for hook in &hooks {
            hook.on_exchange_complete(&exchange, &exchange);
        }
        assert_eq!(captured(&bridge, "CAPTURE").len(), 1);
    }

    #[test]
    fn from_conf() {
        let loader = ConfigurationLoader::new();
        let conf = AccessLogConf {
            enabled: false,
            ..Default::default()
        };
        assert!(AccessLogBridge::from_conf(&loader, &conf).unwrap().is_none());

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("capture.yaml"),
            "sinks: [{type: capture, name: CAPTURE}]",
        )
        .unwrap();
        let conf = AccessLogConf {
            config: Some("capture.yaml".to_owned()),
            resource_dirs: vec![dir.path().to_owned()],
            ..Default::default()
        };
        let loader = ConfigurationLoader::from_conf(&conf);
        let bridge = AccessLogBridge::from_conf(&loader, &conf).unwrap().unwrap();
        assert!(bridge.pipeline().sink("CAPTURE").is_some());

        let conf = AccessLogConf {
            config: Some("missing.yaml".to_owned()),
            ..Default::default()
        };
        assert!(AccessLogBridge::from_conf(&loader, &conf).is_err());
    }
}
