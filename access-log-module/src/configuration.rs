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

//! Structures handling command line options and YAML deserialization for the Access Log Module

use clap::Args;
use http::{header, HeaderName};
use serde::Deserialize;
use std::path::PathBuf;

use crate::filter::FilterReply;

/// Command line options of the access log module
#[derive(Debug, Default, Args)]
pub struct AccessLogOpt {
    /// Access log pipeline configuration file
    ///
    /// Without this option the `ACCESS_LOG_CONFIG` environment variable, then `access-log.yaml`
    /// are tried before falling back to the built-in console pipeline.
    #[arg(long)]
    pub access_log_config: Option<String>,
    /// Log all access log configuration diagnostics, not only warnings and errors
    #[arg(long)]
    pub access_log_debug: bool,
}

/// Server-side settings of the access log module
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AccessLogConf {
    /// Whether access logging is enabled at all
    pub enabled: bool,
    /// Pipeline configuration resource: a file path, a `file:` URL-like path or a name looked
    /// up in the resource directories
    pub config: Option<String>,
    /// Log all configuration diagnostics
    pub debug: bool,
    /// Reuse an already started pipeline loaded from the same resource instead of parsing the
    /// configuration again
    pub allow_reuse: bool,
    /// Directories searched for configuration names that aren’t existing paths
    pub resource_dirs: Vec<PathBuf>,
}

impl Default for AccessLogConf {
    fn default() -> Self {
        Self {
            enabled: true,
            config: None,
            debug: false,
            allow_reuse: true,
            resource_dirs: Vec::new(),
        }
    }
}

impl AccessLogConf {
    /// Merges the command line options into the current configuration. Any command line options
    /// present overwrite existing settings.
    pub fn merge_with_opt(&mut self, opt: AccessLogOpt) {
        if let Some(config) = opt.access_log_config {
            self.config = Some(config);
        }
        if opt.access_log_debug {
            self.debug = true;
        }
    }
}

/// An individual log field of a formatted log line
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum LogField {
    /// Skipped field, `-` in config file
    None,
    /// Client address, `remote_addr` in config file
    RemoteAddr,
    /// Client port, `remote_port` in config file
    RemotePort,
    /// Authenticated user, `remote_user` in config file
    RemoteUser,
    /// Server port, `server_port` in config file
    ServerPort,
    /// Local time in the Common Log Format, `time_local` in config file
    TimeLocal,
    /// Local time in the ISO 8601 format, `time_iso8601` in config file
    TimeISO,
    /// Request line like `"GET / HTTP/1.1"`, `request` in config file
    Request,
    /// Numeric response status code, `status` in config file
    Status,
    /// Number of bytes sent as response, `bytes_sent` in config file
    BytesSent,
    /// Time it took to process the request, `processing_time` in config file
    ProcessingTime,
    /// Pipeline sequence number, `sequence_number` in config file
    SequenceNumber,
    /// A request header, `http_<header>` in config file
    RequestHeader(HeaderName),
    /// A response header, `sent_http_<header>` in config file
    ResponseHeader(HeaderName),
    /// A request cookie, `cookie_<name>` in config file
    Cookie(String),
}

impl LogField {
    /// The format used when a sink doesn’t configure one:
    ///
    /// ```yaml
    /// [remote_addr, -, remote_user, time_local, request, status, bytes_sent, http_referer, http_user_agent]
    /// ```
    pub fn default_format() -> Vec<Self> {
        vec![
            Self::RemoteAddr,
            Self::None,
            Self::RemoteUser,
            Self::TimeLocal,
            Self::Request,
            Self::Status,
            Self::BytesSent,
            Self::RequestHeader(header::REFERER),
            Self::RequestHeader(header::USER_AGENT),
        ]
    }
}

impl TryFrom<&str> for LogField {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "-" => Ok(Self::None),
            "remote_addr" => Ok(Self::RemoteAddr),
            "remote_port" => Ok(Self::RemotePort),
            "remote_user" => Ok(Self::RemoteUser),
            "server_port" => Ok(Self::ServerPort),
            "time_local" => Ok(Self::TimeLocal),
            "time_iso8601" => Ok(Self::TimeISO),
            "request" => Ok(Self::Request),
            "status" => Ok(Self::Status),
            "bytes_sent" => Ok(Self::BytesSent),
            "processing_time" => Ok(Self::ProcessingTime),
            "sequence_number" => Ok(Self::SequenceNumber),
            name => {
                if let Some(header) = name.strip_prefix("http_") {
                    let header = header.replace('_', "-");
                    Ok(Self::RequestHeader(
                        HeaderName::try_from(header).map_err(|err| err.to_string())?,
                    ))
                } else if let Some(header) = name.strip_prefix("sent_http_") {
                    let header = header.replace('_', "-");
                    Ok(Self::ResponseHeader(
                        HeaderName::try_from(header).map_err(|err| err.to_string())?,
                    ))
                } else if let Some(cookie) = name.strip_prefix("cookie_") {
                    if cookie.is_empty() {
                        Err(format!("Missing cookie name in log field {name}"))
                    } else {
                        Ok(Self::Cookie(cookie.to_owned()))
                    }
                } else {
                    Err(format!("Unsupported log field {name}"))
                }
            }
        }
    }
}

impl TryFrom<String> for LogField {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.as_str().try_into()
    }
}

fn default_queue_size() -> usize {
    100
}

/// Configuration of a single sink
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum SinkConf {
    /// Writes formatted lines to standard output
    Console {
        /// Unique sink name
        name: String,
        /// Fields of a log line, see [`LogField::default_format`] for the default
        #[serde(default)]
        format: Vec<LogField>,
        /// Number of lines that can be queued for the writer thread
        #[serde(default = "default_queue_size")]
        queue_size: usize,
    },
    /// Appends formatted lines to a file, `-` means standard output
    File {
        /// Unique sink name
        name: String,
        /// Log file path
        path: PathBuf,
        /// Fields of a log line, see [`LogField::default_format`] for the default
        #[serde(default)]
        format: Vec<LogField>,
        /// Number of lines that can be queued for the writer thread
        #[serde(default = "default_queue_size")]
        queue_size: usize,
    },
    /// Keeps events in memory, see [`CaptureSink`](crate::CaptureSink)
    Capture {
        /// Unique sink name
        name: String,
    },
}

impl SinkConf {
    /// The configured sink name
    pub fn name(&self) -> &str {
        match self {
            Self::Console { name, .. } | Self::File { name, .. } | Self::Capture { name } => name,
        }
    }
}

fn neutral() -> FilterReply {
    FilterReply::Neutral
}

/// Configuration of a pipeline filter
///
/// Each filter evaluates a condition and replies with `on_match` or `on_mismatch`, both default
/// to `neutral`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum FilterConf {
    /// Matches if the request path starts with any of the prefixes
    PathPrefix {
        /// Path prefixes, e.g. `/health`
        prefixes: Vec<String>,
        /// Reply if the condition matches
        #[serde(default = "neutral")]
        on_match: FilterReply,
        /// Reply if the condition doesn’t match
        #[serde(default = "neutral")]
        on_mismatch: FilterReply,
    },
    /// Matches if the response status is within the range, both ends included
    StatusRange {
        /// Lowest matching status
        min: u16,
        /// Highest matching status
        max: u16,
        /// Reply if the condition matches
        #[serde(default = "neutral")]
        on_match: FilterReply,
        /// Reply if the condition doesn’t match
        #[serde(default = "neutral")]
        on_mismatch: FilterReply,
    },
    /// Matches if the request method is one of the listed, compared case-insensitively
    Method {
        /// Request methods, e.g. `OPTIONS`
        methods: Vec<String>,
        /// Reply if the condition matches
        #[serde(default = "neutral")]
        on_match: FilterReply,
        /// Reply if the condition doesn’t match
        #[serde(default = "neutral")]
        on_mismatch: FilterReply,
    },
}

/// Contents of a pipeline configuration file
///
/// ```yaml
/// sequence_number: true
/// filters:
///   - type: path_prefix
///     prefixes: [/health]
///     on_match: deny
/// sinks:
///   - type: file
///     name: FILE
///     path: access.log
///     format: [remote_addr, -, -, time_local, request, status, bytes_sent]
///   - type: console
///     name: CONSOLE
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConf {
    /// Log all configuration diagnostics of this pipeline
    #[serde(default)]
    pub debug: bool,
    /// Number events of this pipeline consecutively
    #[serde(default)]
    pub sequence_number: bool,
    /// Filter chain applied before events reach the sinks
    #[serde(default)]
    pub filters: Vec<FilterConf>,
    /// Sinks in dispatch order
    #[serde(default)]
    pub sinks: Vec<SinkConf>,
}
