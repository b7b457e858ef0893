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

//! Connects Pingora sessions to the access log bridge
//!
//! A Pingora application creates an [`AccessLogCtx`] in its `new_ctx` phase and calls
//! [`AccessLogBridge::log_session`] from its `logging` phase.

use bytes::BytesMut;
use pingora::http::RequestHeader;
use pingora::protocols::l4::socket::SocketAddr;
use pingora::proxy::Session;
use pingora::{Error, ErrorType};
use std::fmt::{Debug, Formatter};
use std::io::{Cursor, Seek, SeekFrom, Write};
use std::time::SystemTime;

use crate::bridge::AccessLogBridge;
use crate::event::{version_str, Endpoint, Headers};
use crate::view::{RequestView, ResponseView};

/// Per-request context of the access log
#[derive(Debug, Clone)]
pub struct AccessLogCtx {
    start: SystemTime,
    remote_user: Option<String>,
}

impl Default for AccessLogCtx {
    fn default() -> Self {
        Self::new()
    }
}

impl AccessLogCtx {
    /// Creates a context, the request is considered started at this point.
    pub fn new() -> Self {
        Self {
            start: SystemTime::now(),
            remote_user: None,
        }
    }

    /// Instant the request was first observed
    pub fn start(&self) -> SystemTime {
        self.start
    }

    /// Records the user name if the application authenticated the request
    pub fn set_remote_user(&mut self, user: impl Into<String>) {
        self.remote_user = Some(user.into());
    }
}

fn endpoint(addr: &SocketAddr) -> Endpoint {
    if let Some(addr) = addr.as_inet() {
        return Endpoint::Inet(*addr);
    }

    #[cfg(unix)]
    if let Some(addr) = addr.as_unix() {
        return Endpoint::Unix(addr.as_pathname().map(ToOwned::to_owned));
    }

    Endpoint::Unix(None)
}

/// Collects headers with their names as received. `HeaderMap` lowercases names, the HTTP/1 wire
/// form keeps the original case.
fn wire_headers(write: impl FnOnce(&mut BytesMut)) -> Headers {
    let mut buf = BytesMut::new();
    write(&mut buf);
    String::from_utf8_lossy(&buf)
        .split("\r\n")
        .filter_map(|line| line.split_once(": "))
        .collect()
}

/// Both views on a Pingora session once the exchange completed
pub struct SessionExchange<'a> {
    session: &'a Session,
    ctx: &'a AccessLogCtx,
}

impl Debug for SessionExchange<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionExchange")
            .field("request", self.session.req_header())
            .field("ctx", self.ctx)
            .finish()
    }
}

impl<'a> SessionExchange<'a> {
    /// Wraps a session and its access log context
    pub fn new(session: &'a Session, ctx: &'a AccessLogCtx) -> Self {
        Self { session, ctx }
    }
}

impl RequestView for SessionExchange<'_> {
    fn start_time(&self) -> SystemTime {
        self.ctx.start
    }

    fn method(&self) -> &str {
        self.session.req_header().method.as_str()
    }

    fn uri(&self) -> &str {
        self.session
            .req_header()
            .uri
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("")
    }

    fn protocol(&self) -> &str {
        version_str(self.session.req_header().version)
    }

    fn request_headers(&self) -> Headers {
        let header = self.session.req_header();
        wire_headers(|buf| header.header_to_h1_wire(buf))
    }

    fn remote_addr(&self) -> Option<Endpoint> {
        self.session.client_addr().map(endpoint)
    }

    fn local_addr(&self) -> Option<Endpoint> {
        self.session.server_addr().map(endpoint)
    }

    fn remote_user(&self) -> Option<&str> {
        self.ctx.remote_user.as_deref()
    }
}

impl ResponseView for SessionExchange<'_> {
    fn status(&self) -> Option<u16> {
        self.session
            .response_written()
            .map(|header| header.status.as_u16())
    }

    fn response_headers(&self) -> Headers {
        match self.session.response_written() {
            Some(header) => wire_headers(|buf| header.header_to_h1_wire(buf)),
            None => Headers::new(),
        }
    }

    fn bytes_sent(&self) -> Option<u64> {
        self.session
            .response_written()
            .map(|_| self.session.body_bytes_sent() as u64)
    }
}

impl AccessLogBridge {
    /// Records the exchange of a Pingora session, to be called from the `logging` phase.
    pub fn log_session(&self, session: &Session, ctx: &AccessLogCtx) {
        let exchange = SessionExchange::new(session, ctx);
        self.on_exchange_complete(&exchange, &exchange);
    }
}

/// Creates a new Pingora session for tests with the given request header
///
/// The session reads from an in-memory buffer, it has neither a client nor a server address.
pub async fn create_test_session(header: RequestHeader) -> Result<Session, Box<Error>> {
    let mut cursor = Cursor::new(Vec::<u8>::new());
    let _ = cursor.write(b"GET / HTTP/1.1\r\n");
    let _ = cursor.write(b"Connection: close\r\n");
    let _ = cursor.write(b"\r\n");
    let _ = cursor.seek(SeekFrom::Start(0));

    let mut session = Session::new_h1(Box::new(cursor));
    if !session.read_request().await? {
        return Err(Error::explain(
            ErrorType::InternalError,
            "test session didn't produce a request",
        ));
    }
    *session.req_header_mut() = header;

    Ok(session)
}
