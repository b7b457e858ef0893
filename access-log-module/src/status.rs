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

//! Diagnostics channel recording what happened while loading and running a pipeline

use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;

/// Number of statuses kept, older ones are discarded.
const MAX_STATUSES: usize = 256;

/// Severity of a status
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StatusLevel {
    /// Progress information
    Info,
    /// Something unexpected that didn’t prevent operation
    Warn,
    /// A failure
    Error,
}

/// A single diagnostic message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    /// Severity
    pub level: StatusLevel,
    /// Component that produced the message
    pub origin: &'static str,
    /// Message text including the cause if any
    pub message: String,
    /// Time the status was recorded
    pub time: SystemTime,
}

/// Collects statuses and forwards them to the `log` facade
///
/// Recording a status never fails or panics. Informational statuses are only logged at info
/// level in debug mode, otherwise at debug level.
#[derive(Debug, Default)]
pub struct StatusManager {
    statuses: Mutex<VecDeque<Status>>,
    debug: AtomicBool,
}

impl StatusManager {
    /// Creates a status manager, `debug` makes all statuses visible.
    pub fn new(debug: bool) -> Self {
        Self {
            statuses: Mutex::default(),
            debug: AtomicBool::new(debug),
        }
    }

    /// Switches debug mode on or off
    pub fn set_debug(&self, debug: bool) {
        self.debug.store(debug, Ordering::Relaxed);
    }

    /// Whether debug mode is on
    pub fn is_debug(&self) -> bool {
        self.debug.load(Ordering::Relaxed)
    }

    /// Records an informational status
    pub fn info(&self, origin: &'static str, message: impl Into<String>) {
        self.add(StatusLevel::Info, origin, message.into());
    }

    /// Records a warning
    pub fn warn(&self, origin: &'static str, message: impl Into<String>) {
        self.add(StatusLevel::Warn, origin, message.into());
    }

    /// Records an error
    pub fn error(&self, origin: &'static str, message: impl Into<String>) {
        self.add(StatusLevel::Error, origin, message.into());
    }

    fn add(&self, level: StatusLevel, origin: &'static str, message: String) {
        match level {
            StatusLevel::Info if self.is_debug() => info!("[{origin}] {message}"),
            StatusLevel::Info => debug!("[{origin}] {message}"),
            StatusLevel::Warn => warn!("[{origin}] {message}"),
            StatusLevel::Error => error!("[{origin}] {message}"),
        }

        let mut statuses = self
            .statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if statuses.len() >= MAX_STATUSES {
            statuses.pop_front();
        }
        statuses.push_back(Status {
            level,
            origin,
            message,
            time: SystemTime::now(),
        });
    }

    /// Copies all recorded statuses
    pub fn statuses(&self) -> Vec<Status> {
        self.statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// The most severe level recorded so far
    pub fn highest_level(&self) -> Option<StatusLevel> {
        self.statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|s| s.level)
            .max()
    }
}
