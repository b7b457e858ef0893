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

//! Resolving configuration resources and turning them into started pipelines

use log::debug;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use crate::configuration::{AccessLogConf, PipelineConf, SinkConf};
use crate::error::ConfigError;
use crate::filter::EvaluatorFilter;
use crate::pipeline::{PipelineContext, PipelineHandle};
use crate::sink::{CaptureSink, Sink};
use crate::writer::WriterSink;

/// Environment variable naming the configuration resource
pub const CONFIG_ENV_VAR: &str = "ACCESS_LOG_CONFIG";

/// Configuration resource tried if the environment variable isn’t set
pub const DEFAULT_CONFIG_FILE_NAME: &str = "access-log.yaml";

const BUILTIN_DEFAULT_IDENTIFIER: &str = "builtin:default";

const BUILTIN_DEFAULT_CONFIG: &str = r#"
sinks:
  - type: console
    name: CONSOLE
"#;

const FILE_PREFIX: &str = "file:";

/// The text of a configuration along with where it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    identifier: String,
    text: String,
}

impl Resource {
    /// An in-memory configuration, `identifier` is used for reuse checks and diagnostics.
    pub fn inline(identifier: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            text: text.into(),
        }
    }

    /// The configuration used when nothing else is found: a single console sink writing the
    /// default log format.
    pub fn builtin_default() -> Self {
        Self::inline(BUILTIN_DEFAULT_IDENTIFIER, BUILTIN_DEFAULT_CONFIG)
    }

    /// Identifier of the resource
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Configuration text
    pub fn text(&self) -> &str {
        &self.text
    }
}

/// Where a configuration should come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceSource {
    /// A file path, optionally prefixed with `file:`, or a name looked up in the resource
    /// directories
    Identifier(String),
    /// A configuration that is already in memory
    Inline(Resource),
}

impl From<&str> for ResourceSource {
    fn from(identifier: &str) -> Self {
        Self::Identifier(identifier.to_owned())
    }
}

impl From<String> for ResourceSource {
    fn from(identifier: String) -> Self {
        Self::Identifier(identifier)
    }
}

impl From<Resource> for ResourceSource {
    fn from(resource: Resource) -> Self {
        Self::Inline(resource)
    }
}

fn read_file(identifier: &str, path: &Path) -> Result<Resource, ConfigError> {
    std::fs::read_to_string(path)
        .map(|text| Resource::inline(identifier, text))
        .map_err(|err| {
            ConfigError::not_found(
                identifier,
                format!("failed reading {}: {err}", path.display()),
            )
        })
}

impl ResourceSource {
    /// Identifier used to recognize a configuration loaded before
    pub fn identifier(&self) -> &str {
        match self {
            Self::Identifier(identifier) => identifier,
            Self::Inline(resource) => resource.identifier(),
        }
    }

    /// Reads the configuration text.
    ///
    /// A `file:` prefix forces the identifier to be treated as a file path. Otherwise an
    /// existing file path wins, then relative names are looked up in `resource_dirs` in order.
    pub fn resolve(self, resource_dirs: &[PathBuf]) -> Result<Resource, ConfigError> {
        let identifier = match self {
            Self::Inline(resource) => return Ok(resource),
            Self::Identifier(identifier) => identifier,
        };

        if let Some(path) = identifier.strip_prefix(FILE_PREFIX) {
            return read_file(&identifier, Path::new(path));
        }

        let path = Path::new(&identifier);
        if path.is_file() {
            return read_file(&identifier, path);
        }

        if path.is_relative() {
            for dir in resource_dirs {
                let candidate = dir.join(path);
                if candidate.is_file() {
                    debug!(
                        "Resolved access log configuration {identifier} to {}",
                        candidate.display()
                    );
                    return read_file(&identifier, &candidate);
                }
            }
        }

        Err(ConfigError::not_found(
            &identifier,
            "not a file and not found in the resource directories",
        ))
    }

    /// Determines the configuration to use when none was specified explicitly.
    ///
    /// The resource named by the `ACCESS_LOG_CONFIG` environment variable has to exist if the
    /// variable is set. Otherwise `access-log.yaml` is used if it can be found, and the
    /// [built-in default](Resource::builtin_default) if not.
    pub fn discover(resource_dirs: &[PathBuf]) -> Result<Resource, ConfigError> {
        Self::discover_with(std::env::var(CONFIG_ENV_VAR).ok(), resource_dirs)
    }

    fn discover_with(
        env_value: Option<String>,
        resource_dirs: &[PathBuf],
    ) -> Result<Resource, ConfigError> {
        if let Some(identifier) = env_value.filter(|value| !value.is_empty()) {
            debug!("Using access log configuration {identifier} from {CONFIG_ENV_VAR}");
            return Self::Identifier(identifier).resolve(resource_dirs);
        }

        match Self::from(DEFAULT_CONFIG_FILE_NAME).resolve(resource_dirs) {
            Ok(resource) => Ok(resource),
            Err(_) => {
                debug!("No {DEFAULT_CONFIG_FILE_NAME} found, using built-in access log configuration");
                Ok(Resource::builtin_default())
            }
        }
    }
}

/// Strategy filling a [`PipelineContext`] from a configuration resource
pub trait Configurator {
    /// Adds sinks and filters described by the resource to the context
    fn configure(
        &self,
        context: &mut PipelineContext,
        resource: &Resource,
    ) -> Result<(), ConfigError>;
}

/// Configurator for YAML files, see [`PipelineConf`] for the format
#[derive(Debug, Default, Clone, Copy)]
pub struct YamlConfigurator;

impl YamlConfigurator {
    fn create_sink(conf: SinkConf) -> Arc<dyn Sink> {
        match conf {
            SinkConf::Console {
                name,
                format,
                queue_size,
            } => Arc::new(WriterSink::console(name, format, queue_size)),
            SinkConf::File {
                name,
                path,
                format,
                queue_size,
            } => Arc::new(WriterSink::file(name, path, format, queue_size)),
            SinkConf::Capture { name } => Arc::new(CaptureSink::new(name)),
        }
    }
}

impl Configurator for YamlConfigurator {
    fn configure(
        &self,
        context: &mut PipelineContext,
        resource: &Resource,
    ) -> Result<(), ConfigError> {
        let conf: PipelineConf = serde_yaml::from_str(resource.text()).map_err(|err| {
            context.status().error("yaml", format!("Invalid configuration: {err}"));
            ConfigError::parse(resource.identifier(), err)
        })?;

        if conf.debug {
            context.status().set_debug(true);
        }
        context.set_sequence_numbers(conf.sequence_number);

        for filter in conf.filters {
            let filter = EvaluatorFilter::try_from(filter).map_err(|err| {
                context.status().error("yaml", err.as_str());
                ConfigError::parse(resource.identifier(), err)
            })?;
            context.add_filter(Arc::new(filter));
        }

        for sink in conf.sinks {
            context.add_sink(Self::create_sink(sink))?;
        }

        Ok(())
    }
}

#[derive(Debug)]
struct Loaded {
    identifier: String,
    pipeline: PipelineHandle,
}

/// Loads configuration resources into started pipelines
///
/// The loader remembers the last pipeline it loaded. Loading again replaces that pipeline and
/// stops the previous one, unless reuse is allowed and the same resource is requested again.
#[derive(Debug, Default)]
pub struct ConfigurationLoader {
    resource_dirs: Vec<PathBuf>,
    debug: bool,
    current: Mutex<Option<Loaded>>,
}

impl ConfigurationLoader {
    /// Creates a loader without resource directories
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a loader with the resource directories and debug flag of the configuration
    pub fn from_conf(conf: &AccessLogConf) -> Self {
        Self {
            resource_dirs: conf.resource_dirs.clone(),
            debug: conf.debug,
            current: Mutex::default(),
        }
    }

    /// Adds a directory to look up configuration names in
    pub fn with_resource_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.resource_dirs.push(dir.into());
        self
    }

    /// Makes informational diagnostics visible
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Directories configuration names are looked up in
    pub fn resource_dirs(&self) -> &[PathBuf] {
        &self.resource_dirs
    }

    /// Loads a configuration and starts its pipeline.
    ///
    /// With `allow_reuse` set, a started pipeline previously loaded from the same identifier is
    /// returned as is, the resource isn’t even read. A failed load leaves any previously loaded
    /// pipeline in place.
    pub fn load(
        &self,
        source: impl Into<ResourceSource>,
        configurator: &dyn Configurator,
        allow_reuse: bool,
    ) -> Result<PipelineHandle, ConfigError> {
        let source = source.into();
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);

        if allow_reuse {
            if let Some(loaded) = current.as_ref() {
                if loaded.identifier == source.identifier() && loaded.pipeline.is_started() {
                    loaded.pipeline.status().info(
                        "loader",
                        format!("Reusing configuration {}", loaded.identifier),
                    );
                    return Ok(loaded.pipeline.clone());
                }
            }
        }

        let resource = source.resolve(&self.resource_dirs)?;
        let mut context = PipelineContext::new(resource.identifier(), self.debug);
        context.status().info(
            "loader",
            format!("Loading configuration {}", resource.identifier()),
        );
        configurator.configure(&mut context, &resource)?;
        let pipeline = Arc::new(context.start()?);

        let previous = current.replace(Loaded {
            identifier: resource.identifier,
            pipeline: pipeline.clone(),
        });
        if let Some(previous) = previous {
            if !Arc::ptr_eq(&previous.pipeline, &pipeline) {
                previous.pipeline.stop();
            }
        }

        Ok(pipeline)
    }

    /// The pipeline loaded last
    pub fn current(&self) -> Option<PipelineHandle> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|loaded| loaded.pipeline.clone())
    }

    /// Stops and forgets the current pipeline, e.g. on shutdown
    pub fn stop(&self) {
        let loaded = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(loaded) = loaded {
            loaded.pipeline.stop();
        }
    }
}
