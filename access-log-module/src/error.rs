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

//! Errors reported while loading a pipeline configuration

use pingora::{Error, ErrorType};

/// Failure to load a pipeline configuration, fatal to server startup
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration resource doesn’t exist or couldn’t be read
    #[error("access log configuration {identifier} not found: {reason}")]
    ResourceNotFound {
        /// Resource identifier as requested
        identifier: String,
        /// What was tried
        reason: String,
    },
    /// The configuration is malformed or references unknown components
    #[error("failed parsing access log configuration {identifier}: {message}")]
    ParseFailure {
        /// Resource identifier
        identifier: String,
        /// Parser or validation message
        message: String,
    },
    /// The pipeline couldn’t be started
    #[error("failed activating access log configuration {identifier}: {message}")]
    ActivationFailure {
        /// Resource identifier
        identifier: String,
        /// Cause of the failure
        message: String,
    },
}

impl ConfigError {
    pub(crate) fn not_found(identifier: &str, reason: impl Into<String>) -> Self {
        Self::ResourceNotFound {
            identifier: identifier.to_owned(),
            reason: reason.into(),
        }
    }

    pub(crate) fn parse(identifier: &str, message: impl ToString) -> Self {
        Self::ParseFailure {
            identifier: identifier.to_owned(),
            message: message.to_string(),
        }
    }

    pub(crate) fn activation(identifier: &str, message: impl ToString) -> Self {
        Self::ActivationFailure {
            identifier: identifier.to_owned(),
            message: message.to_string(),
        }
    }

    /// Identifier of the resource that failed to load
    pub fn identifier(&self) -> &str {
        match self {
            Self::ResourceNotFound { identifier, .. }
            | Self::ParseFailure { identifier, .. }
            | Self::ActivationFailure { identifier, .. } => identifier,
        }
    }
}

impl From<ConfigError> for Box<Error> {
    fn from(err: ConfigError) -> Self {
        let kind = match err {
            ConfigError::ResourceNotFound { .. } => ErrorType::FileOpenError,
            ConfigError::ParseFailure { .. } => ErrorType::FileReadError,
            ConfigError::ActivationFailure { .. } => ErrorType::InternalError,
        };
        Error::because(kind, "failed loading access log configuration", err)
    }
}
