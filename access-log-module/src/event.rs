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

//! The access event record produced for every completed exchange

use http::Version;
use percent_encoding::percent_decode_str;
use std::borrow::Cow;
use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use crate::view::{RequestView, ResponseView};

/// Address of one side of a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// An IP address and port
    Inet(SocketAddr),
    /// A Unix domain socket, unnamed sockets have no path
    Unix(Option<PathBuf>),
}

impl Endpoint {
    /// The host part: IP address or socket path
    pub fn host(&self) -> Option<Cow<'_, str>> {
        match self {
            Self::Inet(addr) => Some(addr.ip().to_string().into()),
            Self::Unix(path) => path.as_ref().map(|p| p.to_string_lossy()),
        }
    }

    /// The port, only known for IP endpoints
    pub fn port(&self) -> Option<u16> {
        match self {
            Self::Inet(addr) => Some(addr.port()),
            Self::Unix(_) => None,
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::Inet(addr)
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inet(addr) => write!(f, "{addr}"),
            Self::Unix(Some(path)) => write!(f, "unix:{}", path.display()),
            Self::Unix(None) => write!(f, "unix:"),
        }
    }
}

/// Header names and values in the order they were received
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    /// Creates an empty header list
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a header, existing headers with the same name are kept.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// Returns the first value of a header, names are compared case-insensitively.
    pub fn get<'a>(&'a self, name: &'a str) -> Option<&'a str> {
        self.get_all(name).next()
    }

    /// Returns all values of a header in order
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Iterates over all name/value pairs
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Number of header lines
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if there are no headers
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<N, V> FromIterator<(N, V)> for Headers
where
    N: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(n, v)| (n.into(), v.into()))
                .collect(),
        )
    }
}

/// Converts an HTTP version into the string used in request lines.
pub fn version_str(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_11 => "HTTP/1.1",
        Version::HTTP_2 => "HTTP/2.0",
        Version::HTTP_3 => "HTTP/3.0",
        _ => "-",
    }
}

fn decode_component(value: &str) -> String {
    let value = value.replace('+', " ");
    match percent_decode_str(&value).decode_utf8() {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => value,
    }
}

/// One completed HTTP exchange
///
/// Events are only built once the response has been fully written and cannot be changed
/// afterwards. All data is copied out of the server’s request and response objects, an event
/// never refers back to them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessEvent {
    timestamp: SystemTime,
    sequence_number: u64,
    thread_name: Option<String>,
    method: String,
    request_uri: String,
    protocol: String,
    request_headers: Headers,
    remote_addr: Option<Endpoint>,
    local_addr: Option<Endpoint>,
    remote_user: Option<String>,
    status: u16,
    response_headers: Headers,
    content_length: u64,
    elapsed: Duration,
}

impl AccessEvent {
    /// Copies the exchange data out of the request and response views.
    ///
    /// `completed` is the moment the exchange is considered finished, elapsed time is measured
    /// from the request’s start time up to it.
    pub fn capture(
        request: &dyn RequestView,
        response: &dyn ResponseView,
        completed: SystemTime,
        sequence_number: u64,
    ) -> Self {
        let timestamp = request.start_time();
        Self {
            timestamp,
            sequence_number,
            thread_name: std::thread::current().name().map(ToOwned::to_owned),
            method: request.method().to_owned(),
            request_uri: request.uri().to_owned(),
            protocol: request.protocol().to_owned(),
            request_headers: request.request_headers(),
            remote_addr: request.remote_addr(),
            local_addr: request.local_addr(),
            remote_user: request.remote_user().map(ToOwned::to_owned),
            status: response.status().unwrap_or(0),
            response_headers: response.response_headers(),
            content_length: response.bytes_sent().unwrap_or(0),
            elapsed: completed.duration_since(timestamp).unwrap_or_default(),
        }
    }

    /// Time the request was first observed
    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    /// Sequence number assigned by the pipeline, `0` if numbering is disabled
    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    /// Name of the thread that completed the exchange
    pub fn thread_name(&self) -> Option<&str> {
        self.thread_name.as_deref()
    }

    /// Request method, e.g. `GET`
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Path and query exactly as requested
    pub fn request_uri(&self) -> &str {
        &self.request_uri
    }

    /// The path without query string
    pub fn path(&self) -> &str {
        match self.request_uri.split_once('?') {
            Some((path, _)) => path,
            None => &self.request_uri,
        }
    }

    /// The query string without the leading `?`, if there is one
    pub fn query_string(&self) -> Option<&str> {
        self.request_uri.split_once('?').map(|(_, query)| query)
    }

    /// Decoded query parameters in order of appearance
    ///
    /// Pairs without a name or without a value are skipped. Components that don’t decode to
    /// valid UTF-8 are kept verbatim.
    pub fn query_params(&self) -> Vec<(String, String)> {
        let Some(query) = self.query_string() else {
            return Vec::new();
        };

        query
            .split('&')
            .filter_map(|pair| {
                let (name, value) = pair.split_once('=')?;
                if name.is_empty() || value.is_empty() {
                    return None;
                }
                Some((decode_component(name), decode_component(value)))
            })
            .collect()
    }

    /// First decoded value of a query parameter
    pub fn query_param(&self, name: &str) -> Option<String> {
        self.query_params()
            .into_iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Protocol version, e.g. `HTTP/1.1`
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// The request line like `GET /index.html HTTP/1.1`
    pub fn request_line(&self) -> String {
        format!("{} {} {}", self.method, self.request_uri, self.protocol)
    }

    /// All request headers
    pub fn request_headers(&self) -> &Headers {
        &self.request_headers
    }

    /// First value of a request header
    pub fn request_header<'a>(&'a self, name: &'a str) -> Option<&'a str> {
        self.request_headers.get(name)
    }

    /// Cookies sent with the request, one entry per name
    ///
    /// All `Cookie` headers are considered. Cookies with an empty name or value are skipped, if a
    /// name repeats the first value wins.
    pub fn cookies(&self) -> Vec<(&str, &str)> {
        let mut cookies: Vec<(&str, &str)> = Vec::new();
        for pair in self.request_headers.get_all("Cookie").flat_map(|h| h.split(';')) {
            let Some((name, value)) = pair.split_once('=') else {
                continue;
            };
            let (name, value) = (name.trim(), value.trim());
            if name.is_empty() || value.is_empty() || cookies.iter().any(|(n, _)| *n == name) {
                continue;
            }
            cookies.push((name, value));
        }
        cookies
    }

    /// Value of a request cookie, names are case-sensitive.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies()
            .into_iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v)
    }

    /// Client address
    pub fn remote_addr(&self) -> Option<&Endpoint> {
        self.remote_addr.as_ref()
    }

    /// Client host: the IP address or the socket path
    pub fn remote_host(&self) -> Option<Cow<'_, str>> {
        self.remote_addr.as_ref().and_then(Endpoint::host)
    }

    /// Server address the connection was accepted on
    pub fn local_addr(&self) -> Option<&Endpoint> {
        self.local_addr.as_ref()
    }

    /// Authenticated user name
    pub fn remote_user(&self) -> Option<&str> {
        self.remote_user.as_deref()
    }

    /// Response status, `0` if the exchange ended before a response header was sent
    pub fn status(&self) -> u16 {
        self.status
    }

    /// All response headers
    pub fn response_headers(&self) -> &Headers {
        &self.response_headers
    }

    /// First value of a response header
    pub fn response_header<'a>(&'a self, name: &'a str) -> Option<&'a str> {
        self.response_headers.get(name)
    }

    /// Number of response body bytes written
    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    /// Time between request start and completion
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Elapsed time in whole milliseconds
    pub fn elapsed_millis(&self) -> u128 {
        self.elapsed.as_millis()
    }

    /// Elapsed time in whole seconds, rounded down
    pub fn elapsed_seconds(&self) -> u64 {
        self.elapsed.as_secs()
    }
}
