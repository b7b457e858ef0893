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

//! Filters deciding whether an event reaches the sinks

use serde::Deserialize;
use std::fmt::Debug;
use std::sync::Arc;

use crate::configuration::FilterConf;
use crate::event::AccessEvent;

/// Decision of a single filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterReply {
    /// Drop the event, no further filters are consulted
    Deny,
    /// No opinion, ask the next filter
    Neutral,
    /// Log the event, no further filters are consulted
    Accept,
}

/// A filter in the pipeline’s filter chain
pub trait Filter: Debug + Send + Sync {
    /// Decides on the given event
    fn decide(&self, event: &AccessEvent) -> FilterReply;
}

/// Runs the filter chain: the first non-neutral reply wins. All filters being neutral results in
/// [`FilterReply::Neutral`].
pub fn chain_decision(filters: &[Arc<dyn Filter>], event: &AccessEvent) -> FilterReply {
    for filter in filters {
        match filter.decide(event) {
            FilterReply::Neutral => continue,
            reply => return reply,
        }
    }
    FilterReply::Neutral
}

/// Condition evaluated by an [`EvaluatorFilter`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matcher {
    /// Request path starts with any of these
    PathPrefix(Vec<String>),
    /// Response status within the inclusive range
    StatusRange(u16, u16),
    /// Request method is any of these
    Method(Vec<String>),
}

impl Matcher {
    fn matches(&self, event: &AccessEvent) -> bool {
        match self {
            Self::PathPrefix(prefixes) => {
                let path = event.path();
                prefixes.iter().any(|prefix| path.starts_with(prefix.as_str()))
            }
            Self::StatusRange(min, max) => (*min..=*max).contains(&event.status()),
            Self::Method(methods) => methods
                .iter()
                .any(|method| method.eq_ignore_ascii_case(event.method())),
        }
    }
}

/// Filter replying with one of two configured replies depending on a condition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluatorFilter {
    matcher: Matcher,
    on_match: FilterReply,
    on_mismatch: FilterReply,
}

impl EvaluatorFilter {
    /// Creates a new filter
    pub fn new(matcher: Matcher, on_match: FilterReply, on_mismatch: FilterReply) -> Self {
        Self {
            matcher,
            on_match,
            on_mismatch,
        }
    }
}

impl Filter for EvaluatorFilter {
    fn decide(&self, event: &AccessEvent) -> FilterReply {
        if self.matcher.matches(event) {
            self.on_match
        } else {
            self.on_mismatch
        }
    }
}

impl TryFrom<FilterConf> for EvaluatorFilter {
    type Error = String;

    fn try_from(conf: FilterConf) -> Result<Self, Self::Error> {
        match conf {
            FilterConf::PathPrefix {
                prefixes,
                on_match,
                on_mismatch,
            } => Ok(Self::new(Matcher::PathPrefix(prefixes), on_match, on_mismatch)),
            FilterConf::StatusRange {
                min,
                max,
                on_match,
                on_mismatch,
            } => {
                if min > max {
                    return Err(format!("Invalid status range {min}-{max}"));
                }
                Ok(Self::new(Matcher::StatusRange(min, max), on_match, on_mismatch))
            }
            FilterConf::Method {
                methods,
                on_match,
                on_mismatch,
            } => Ok(Self::new(Matcher::Method(methods), on_match, on_mismatch)),
        }
    }
}
