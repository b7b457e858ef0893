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

//! # Access Log Module for Pingora
//!
//! This crate turns every completed Pingora exchange into an [`AccessEvent`] and dispatches it
//! to a pipeline of sinks loaded from a configuration resource. A pipeline configuration could
//! look like this:
//!
//! ```yaml
//! sequence_number: false
//! filters:
//!   - type: path_prefix
//!     prefixes: [/health]
//!     on_match: deny
//! sinks:
//!   - type: file
//!     name: FILE
//!     path: access.log
//!     format: [remote_addr, -, remote_user, time_local, request, status, bytes_sent]
//!   - type: console
//!     name: CONSOLE
//! ```
//!
//! The supported sink types are:
//!
//! * `console`: formatted lines written to standard output
//! * `file`: formatted lines appended to a file, `-` as path means standard output
//! * `capture`: events kept in memory, mostly useful for tests
//!
//! Formatted lines are assembled from these fields:
//!
//! * `-`: Verbatim `-` character (for unsupported fields)
//! * `remote_addr`: client’s IP address
//! * `remote_port`: client’s TCP port
//! * `remote_user`: quoted name of the authenticated user
//! * `server_port`: port the request was received on
//! * `time_local`: date and time of the request, e.g. `[10/Oct/2000:13:55:36 -0700]`
//! * `time_iso8601`: date and time in the ISO 8601 format, e.g. `[2000-10-10T13:55:36-07:00]`
//! * `request`: quoted request line, e.g. `"GET / HTTP/1.1"`
//! * `status`: status code of the response, e.g. `200`
//! * `bytes_sent`: number of bytes sent as response
//! * `processing_time`: time from request being received to response in milliseconds
//! * `sequence_number`: consecutive event number if enabled for the pipeline
//! * `http_<header>`: quoted value of an HTTP request header. For example, `http_user_agent` adds
//!   the value of the `User-Agent` HTTP header to the log.
//! * `sent_http_<header>`: quoted value of an HTTP response header. For example,
//!   `sent_http_content_type` adds the value of the `Content-Type` HTTP header to the log.
//! * `cookie_<name>`: quoted value of a request cookie. For example, `cookie_lang` adds the value
//!   of the `lang` cookie to the log. Cookie names are case-sensitive.
//!
//! Filters reply `deny`, `neutral` or `accept`. The first filter that isn’t neutral decides, an
//! event nobody denied is logged.
//!
//! If no configuration is given explicitly, the resource named by the `ACCESS_LOG_CONFIG`
//! environment variable is used, then `access-log.yaml`, then a built-in configuration writing
//! to the console.
//!
//! On Unix-based systems, the process can be sent a `HUP` or `USR1` signal to make it re-open log
//! files. This is useful after the logs have been rotated for example.
//!
//! ## Code example
//!
//! The bridge is set up once, before the server starts. `AccessLogCtx` is created in the
//! `new_ctx` phase, the actual logging happens in the `logging` phase via
//! [`AccessLogBridge::log_session`].
//!
//! ```rust
//! use access_log_module::{
//!     AccessLogBridge, CaptureSink, ConfigurationLoader, Resource, YamlConfigurator,
//! };
//!
//! let loader = ConfigurationLoader::new();
//! let bridge = AccessLogBridge::load(
//!     &loader,
//!     Resource::inline("example", "sinks: [{type: capture, name: CAPTURE}]"),
//!     &YamlConfigurator,
//!     true,
//! )
//! .unwrap();
//!
//! let capture = bridge.pipeline().sink_as::<CaptureSink>("CAPTURE").unwrap();
//! assert!(capture.is_empty());
//! ```
//!
//! For a complete server see the `access-log-server` crate in the repository.

mod bridge;
pub mod configuration;
mod error;
mod event;
mod filter;
mod loader;
mod pipeline;
mod session;
#[cfg(unix)]
mod signal;
mod sink;
mod status;
#[cfg(test)]
mod test_utils;
mod view;
mod writer;

pub use bridge::AccessLogBridge;
pub use configuration::{AccessLogConf, AccessLogOpt, LogField};
pub use error::ConfigError;
pub use event::{version_str, AccessEvent, Endpoint, Headers};
pub use filter::{chain_decision, EvaluatorFilter, Filter, FilterReply, Matcher};
pub use loader::{
    ConfigurationLoader, Configurator, Resource, ResourceSource, YamlConfigurator,
    CONFIG_ENV_VAR, DEFAULT_CONFIG_FILE_NAME,
};
pub use pipeline::{Pipeline, PipelineContext, PipelineHandle};
pub use session::{create_test_session, AccessLogCtx, SessionExchange};
pub use sink::{CaptureSink, Sink, SinkError};
pub use status::{Status, StatusLevel, StatusManager};
pub use view::{RequestCompletionHook, RequestView, ResponseView};
pub use writer::{LogTarget, WriterSink};
