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

//! Fabricated exchanges for unit tests

use std::io::Write;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use crate::event::{Endpoint, Headers};
use crate::view::{RequestView, ResponseView};

#[derive(Debug, Clone)]
pub(crate) struct TestExchange {
    pub(crate) start: SystemTime,
    pub(crate) method: String,
    pub(crate) uri: String,
    pub(crate) request_headers: Headers,
    pub(crate) remote_addr: Option<Endpoint>,
    pub(crate) remote_user: Option<String>,
    pub(crate) status: Option<u16>,
    pub(crate) response_headers: Headers,
    pub(crate) bytes_sent: Option<u64>,
}

impl TestExchange {
    pub(crate) fn get(uri: &str) -> Self {
        Self {
            // 2024-05-29 10:53:19 UTC
            start: SystemTime::UNIX_EPOCH + Duration::from_secs(1716979999),
            method: "GET".to_owned(),
            uri: uri.to_owned(),
            request_headers: Headers::new(),
            remote_addr: Some(Endpoint::Inet("192.0.2.1:54321".parse().unwrap())),
            remote_user: None,
            status: None,
            response_headers: Headers::new(),
            bytes_sent: None,
        }
    }

    pub(crate) fn with_method(mut self, method: &str) -> Self {
        self.method = method.to_owned();
        self
    }

    pub(crate) fn with_request_header(mut self, name: &str, value: &str) -> Self {
        self.request_headers.push(name, value);
        self
    }

    pub(crate) fn with_response(mut self, status: u16, content_type: &str, bytes: u64) -> Self {
        self.status = Some(status);
        self.response_headers.push("Content-Type", content_type);
        self.response_headers
            .push("Content-Length", bytes.to_string());
        self.bytes_sent = Some(bytes);
        self
    }
}

impl RequestView for TestExchange {
    fn start_time(&self) -> SystemTime {
        self.start
    }

    fn method(&self) -> &str {
        &self.method
    }

    fn uri(&self) -> &str {
        &self.uri
    }

    fn protocol(&self) -> &str {
        "HTTP/1.1"
    }

    fn request_headers(&self) -> Headers {
        self.request_headers.clone()
    }

    fn remote_addr(&self) -> Option<Endpoint> {
        self.remote_addr.clone()
    }

    fn local_addr(&self) -> Option<Endpoint> {
        Some(Endpoint::Inet("127.0.0.1:8080".parse().unwrap()))
    }

    fn remote_user(&self) -> Option<&str> {
        self.remote_user.as_deref()
    }
}

impl ResponseView for TestExchange {
    fn status(&self) -> Option<u16> {
        self.status
    }

    fn response_headers(&self) -> Headers {
        self.response_headers.clone()
    }

    fn bytes_sent(&self) -> Option<u64> {
        self.bytes_sent
    }
}

/// Writer blocking on its first write until released
#[derive(Debug)]
pub(crate) struct StalledWriter {
    stalled: Sender<()>,
    release: Option<Receiver<()>>,
    output: Arc<Mutex<Vec<u8>>>,
}

/// Test side of a [`StalledWriter`]
#[derive(Debug)]
pub(crate) struct StalledWriterControl {
    stalled: Receiver<()>,
    release: Sender<()>,
    output: Arc<Mutex<Vec<u8>>>,
}

impl StalledWriter {
    pub(crate) fn new() -> (Self, StalledWriterControl) {
        let (stalled_sender, stalled_receiver) = channel();
        let (release_sender, release_receiver) = channel();
        let output = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                stalled: stalled_sender,
                release: Some(release_receiver),
                output: output.clone(),
            },
            StalledWriterControl {
                stalled: stalled_receiver,
                release: release_sender,
                output,
            },
        )
    }
}

impl Write for StalledWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Some(release) = self.release.take() {
            let _ = self.stalled.send(());
            let _ = release.recv();
        }
        self.output.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl StalledWriterControl {
    pub(crate) fn wait_until_stalled(&self) {
        self.stalled.recv_timeout(Duration::from_secs(10)).unwrap();
    }

    pub(crate) fn release(&self) {
        let _ = self.release.send(());
    }

    pub(crate) fn output(&self) -> String {
        String::from_utf8(self.output.lock().unwrap().clone()).unwrap()
    }
}
