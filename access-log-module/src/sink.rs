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

//! Consumers of access events

use std::any::Any;
use std::fmt::Debug;
use std::sync::{Mutex, PoisonError};

use crate::event::AccessEvent;

/// Failure of a single sink while handling an event
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The sink was never started or has been stopped
    #[error("sink {0} is not started")]
    NotStarted(String),
    /// The sink’s queue is full, the event was dropped
    #[error("queue of sink {0} is full, event dropped")]
    QueueFull(String),
    /// The sink’s writer thread is gone
    #[error("writer of sink {0} has terminated")]
    Disconnected(String),
    /// An I/O operation failed
    #[error("I/O error in sink {name}: {source}")]
    Io {
        /// Sink name
        name: String,
        /// Cause
        #[source]
        source: std::io::Error,
    },
    /// Any other failure
    #[error("sink {name} failed: {message}")]
    Failed {
        /// Sink name
        name: String,
        /// Description of the failure
        message: String,
    },
}

/// A consumer of access events
///
/// Sinks are shared between all server threads, `append` can be called concurrently and has to
/// take care of its own synchronization.
pub trait Sink: Debug + Send + Sync {
    /// Unique name of the sink within its pipeline
    fn name(&self) -> &str;

    /// Acquires resources, called once before the first event.
    fn start(&self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Consumes an event
    fn append(&self, event: &AccessEvent) -> Result<(), SinkError>;

    /// Releases resources, events still queued are processed first.
    fn stop(&self) {}

    /// Allows downcasting to the concrete sink type
    fn as_any(&self) -> &dyn Any;
}

/// Sink keeping all events in memory
///
/// Mostly useful for tests and introspection.
#[derive(Debug)]
pub struct CaptureSink {
    name: String,
    events: Mutex<Vec<AccessEvent>>,
}

impl CaptureSink {
    /// Creates an empty capture sink
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            events: Mutex::default(),
        }
    }

    /// Copies the events captured so far
    pub fn events(&self) -> Vec<AccessEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of events captured so far
    pub fn len(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns `true` if nothing was captured
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes all captured events
    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Sink for CaptureSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn append(&self, event: &AccessEvent) -> Result<(), SinkError> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
