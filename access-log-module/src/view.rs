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

//! The boundary between the server and the access log: views on a completed exchange and the
//! completion hook receiving them

use std::time::SystemTime;

use crate::event::{Endpoint, Headers};

/// Read access to the request side of a completed exchange
///
/// A view is only valid for the duration of a single [`RequestCompletionHook`] call.
pub trait RequestView {
    /// Instant the request was first observed
    fn start_time(&self) -> SystemTime;

    /// Request method as sent by the client
    fn method(&self) -> &str;

    /// Path and query as sent by the client
    fn uri(&self) -> &str;

    /// Protocol version, e.g. `HTTP/1.1`
    fn protocol(&self) -> &str;

    /// Request headers in order of appearance
    fn request_headers(&self) -> Headers;

    /// Client address if known
    fn remote_addr(&self) -> Option<Endpoint>;

    /// Server address if known
    fn local_addr(&self) -> Option<Endpoint>;

    /// Name of the authenticated user if any
    fn remote_user(&self) -> Option<&str> {
        None
    }
}

/// Read access to the response side of a completed exchange
pub trait ResponseView {
    /// Status code of the response, `None` if no response header was sent
    fn status(&self) -> Option<u16>;

    /// Response headers as sent, empty if no response header was sent
    fn response_headers(&self) -> Headers;

    /// Number of response body bytes written if the server counts them
    fn bytes_sent(&self) -> Option<u64>;
}

/// Callback invoked by the server exactly once per exchange, after the response has been sent
/// or the exchange has been terminated.
///
/// Implementations must not keep references to the views beyond the call. This trait is
/// implemented for [`AccessLogBridge`](crate::AccessLogBridge) as well as for closures.
pub trait RequestCompletionHook: Send + Sync {
    /// Handles a completed exchange. Must not panic or block indefinitely.
    fn on_exchange_complete(&self, request: &dyn RequestView, response: &dyn ResponseView);
}

impl<F> RequestCompletionHook for F
where
    F: Fn(&dyn RequestView, &dyn ResponseView) + Send + Sync,
{
    fn on_exchange_complete(&self, request: &dyn RequestView, response: &dyn ResponseView) {
        self(request, response)
    }
}
