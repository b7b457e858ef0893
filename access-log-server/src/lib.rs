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

#![doc = include_str!("../README.md")]

mod configuration;

use access_log_module::{AccessLogBridge, AccessLogCtx, ConfigurationLoader};
use async_trait::async_trait;
use bytes::Bytes;
use http::{header, Method};
use log::info;
use pingora::http::ResponseHeader;
use pingora::proxy::{ProxyHttp, Session};
use pingora::server::ShutdownWatch;
use pingora::services::background::BackgroundService;
use pingora::upstreams::peer::HttpPeer;
use pingora::{Error, ErrorType};
use std::sync::Arc;

pub use configuration::{ServerConf, ServerOpt, StartupOpt};

/// A Pingora app answering every request with the same response
///
/// The response is written in the `request_filter` phase, so no upstream is ever contacted.
/// Every exchange is logged through the access log bridge in the `logging` phase.
#[derive(Debug)]
pub struct StaticResponseApp {
    response: Bytes,
    status: u16,
    bridge: Option<AccessLogBridge>,
}

impl StaticResponseApp {
    /// Creates a new app, `bridge` can be `None` to disable access logging.
    pub fn new(
        response: impl Into<Bytes>,
        status: u16,
        bridge: Option<AccessLogBridge>,
    ) -> Result<Self, Box<Error>> {
        if !(100..=999).contains(&status) {
            return Err(Error::explain(
                ErrorType::InternalError,
                format!("invalid response status {status}"),
            ));
        }

        Ok(Self {
            response: response.into(),
            status,
            bridge,
        })
    }

    /// Creates the app and its access log bridge from the configuration.
    ///
    /// Fails if the access log configuration cannot be loaded.
    pub fn from_conf(
        conf: &ServerConf,
        loader: &ConfigurationLoader,
    ) -> Result<Self, Box<Error>> {
        let bridge = AccessLogBridge::from_conf(loader, &conf.access_log)?;
        if let Some(bridge) = &bridge {
            info!(
                "Access log pipeline {} started with {} sink(s)",
                bridge.pipeline().name(),
                bridge.pipeline().sinks().len()
            );
        }
        Self::new(conf.response.clone(), conf.response_status, bridge)
    }

    /// The access log bridge if logging is enabled
    pub fn bridge(&self) -> Option<&AccessLogBridge> {
        self.bridge.as_ref()
    }
}

#[async_trait]
impl ProxyHttp for StaticResponseApp {
    type CTX = AccessLogCtx;

    fn new_ctx(&self) -> Self::CTX {
        AccessLogCtx::new()
    }

    async fn request_filter(
        &self,
        session: &mut Session,
        _ctx: &mut Self::CTX,
    ) -> Result<bool, Box<Error>> {
        let mut header = ResponseHeader::build(self.status, Some(2))?;
        header.insert_header(header::CONTENT_TYPE, "text/plain")?;
        header.insert_header(header::CONTENT_LENGTH, self.response.len().to_string())?;

        if session.req_header().method == Method::HEAD {
            session.write_response_header(Box::new(header), true).await?;
        } else {
            session
                .write_response_header(Box::new(header), false)
                .await?;
            session
                .write_response_body(Some(self.response.clone()), true)
                .await?;
        }

        Ok(true)
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        _ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>, Box<Error>> {
        Err(Error::explain(
            ErrorType::InternalError,
            "static response app has no upstream",
        ))
    }

    async fn logging(&self, session: &mut Session, _e: Option<&Error>, ctx: &mut Self::CTX) {
        if let Some(bridge) = &self.bridge {
            bridge.log_session(session, ctx);
        }
    }
}

/// Background service stopping the access log pipeline when the server shuts down
///
/// Stopping lets the writer threads drain their queues before the process exits.
#[derive(Debug, Clone)]
pub struct ShutdownService {
    loader: Arc<ConfigurationLoader>,
}

impl ShutdownService {
    /// Creates a service stopping the pipeline held by the loader
    pub fn new(loader: Arc<ConfigurationLoader>) -> Self {
        Self { loader }
    }
}

#[async_trait]
impl BackgroundService for ShutdownService {
    async fn start(&self, mut shutdown: ShutdownWatch) {
        let _ = shutdown.changed().await;
        info!("Stopping access log pipeline");
        self.loader.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use access_log_module::{
        create_test_session, AccessEvent, CaptureSink, Resource, YamlConfigurator,
    };
    use pingora::http::RequestHeader;
    use test_log::test;

    fn capture_bridge() -> AccessLogBridge {
        let loader = ConfigurationLoader::new();
        AccessLogBridge::load(
            &loader,
            Resource::inline("capture", "sinks: [{type: capture, name: CAPTURE}]"),
            &YamlConfigurator,
            false,
        )
        .unwrap()
    }

    async fn handle_request(
        app: &StaticResponseApp,
        method: &str,
        uri: &str,
    ) -> Result<(), Box<Error>> {
        let header = RequestHeader::build(method, uri.as_bytes(), None)?;
        let mut session = create_test_session(header).await?;

        let mut ctx = app.new_ctx();
        let result = app.request_filter(&mut session, &mut ctx).await;
        app.logging(
            &mut session,
            result.as_ref().err().map(|err| &**err),
            &mut ctx,
        )
        .await;
        result.map(|_| ())
    }

    fn captured(app: &StaticResponseApp) -> Vec<AccessEvent> {
        app.bridge()
            .unwrap()
            .pipeline()
            .sink_as::<CaptureSink>("CAPTURE")
            .unwrap()
            .events()
    }

    #[test(tokio::test)]
    async fn single_request() -> Result<(), Box<Error>> {
        let app = StaticResponseApp::new("test", 200, Some(capture_bridge()))?;
        handle_request(&app, "GET", "/test").await?;

        let events = captured(&app);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].request_uri(), "/test");
        assert_eq!(events[0].method(), "GET");
        assert_eq!(events[0].status(), 200);
        assert_eq!(events[0].content_length(), 4);
        assert_eq!(events[0].response_header("Content-Type"), Some("text/plain"));
        Ok(())
    }

    #[test(tokio::test)]
    async fn head_request() -> Result<(), Box<Error>> {
        let app = StaticResponseApp::new("test", 404, Some(capture_bridge()))?;
        handle_request(&app, "HEAD", "/missing").await?;

        let events = captured(&app);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status(), 404);
        assert_eq!(events[0].content_length(), 0);
        Ok(())
    }

    #[test(tokio::test)]
    async fn logging_disabled() -> Result<(), Box<Error>> {
        let app = StaticResponseApp::new("test", 200, None)?;
        handle_request(&app, "GET", "/").await?;
        assert!(app.bridge().is_none());
        Ok(())
    }

    #[test]
    fn invalid_status() {
        assert!(StaticResponseApp::new("test", 42, None).is_err());
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn concurrent_requests() -> Result<(), Box<Error>> {
        let app = Arc::new(StaticResponseApp::new("test", 200, Some(capture_bridge()))?);

        let mut tasks = Vec::new();
        for i in 0..100 {
            let app = app.clone();
            tasks.push(tokio::spawn(async move {
                handle_request(&app, "GET", &format!("/item/{i}")).await
            }));
        }
        for task in tasks {
            task.await.unwrap()?;
        }

        let events = captured(&app);
        assert_eq!(events.len(), 100);
        let mut uris: Vec<_> = events.iter().map(|e| e.request_uri().to_owned()).collect();
        uris.sort();
        uris.dedup();
        assert_eq!(uris.len(), 100);
        assert!(events.iter().all(|e| e.status() == 200 && e.content_length() == 4));
        Ok(())
    }

    #[test]
    fn from_conf() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("pipeline.yaml"),
            "sinks: [{type: capture, name: CAPTURE}]",
        )
        .unwrap();

        let mut conf = ServerConf::from_yaml("response: hi\naccess_log: {config: pipeline.yaml}")
            .unwrap();
        conf.access_log.resource_dirs.push(dir.path().to_owned());
        let loader = ConfigurationLoader::from_conf(&conf.access_log);
        let app = StaticResponseApp::from_conf(&conf, &loader).unwrap();
        assert!(app.bridge().is_some());

        conf.access_log.config = Some("missing.yaml".to_owned());
        assert!(StaticResponseApp::from_conf(&conf, &loader).is_err());

        conf.access_log.enabled = false;
        let app = StaticResponseApp::from_conf(&conf, &loader).unwrap();
        assert!(app.bridge().is_none());
    }
}
