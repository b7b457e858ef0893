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

//! Command line options and configuration file of the server

use access_log_module::{AccessLogConf, AccessLogOpt};
use clap::Args;
use log::trace;
use pingora::proxy::{http_proxy_service, ProxyHttp};
use pingora::server::configuration::{Opt as PingoraOpt, ServerConf as PingoraConf};
use pingora::server::Server;
use pingora::services::background::background_service;
use pingora::{Error, ErrorType};
use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use crate::ShutdownService;

/// Run Access Log Server
#[derive(Debug, Default, Args)]
pub struct StartupOpt {
    /// Address to listen on, e.g. 127.0.0.1:8080. This option can be specified multiple times.
    #[arg(short, long)]
    pub listen: Option<Vec<String>>,
    /// Run in the background
    #[arg(short, long)]
    pub daemon: bool,
    /// Test the configuration and exit
    #[arg(short, long)]
    pub test: bool,
    /// Server configuration file
    #[arg(short, long)]
    pub conf: Option<PathBuf>,
}

/// Command line options of the server
#[derive(Debug, Default, clap::Parser)]
#[command(version, about)]
pub struct ServerOpt {
    /// Server options
    #[command(flatten)]
    pub startup: StartupOpt,
    /// Access log options
    #[command(flatten)]
    pub access_log: AccessLogOpt,
}

fn default_threads() -> usize {
    1
}

fn default_response() -> String {
    "OK\n".to_owned()
}

fn default_status() -> u16 {
    200
}

/// Contents of the server configuration file
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConf {
    /// Addresses to listen on
    #[serde(default)]
    pub listen: Vec<String>,
    /// Number of worker threads
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// Body of every response
    #[serde(default = "default_response")]
    pub response: String,
    /// Status code of every response
    #[serde(default = "default_status")]
    pub response_status: u16,
    /// Access log settings
    #[serde(default)]
    pub access_log: AccessLogConf,
}

impl Default for ServerConf {
    fn default() -> Self {
        Self {
            listen: Vec::new(),
            threads: default_threads(),
            response: default_response(),
            response_status: default_status(),
            access_log: AccessLogConf::default(),
        }
    }
}

impl ServerConf {
    /// Loads the configuration from a YAML file
    pub fn load_from_yaml(path: impl AsRef<Path>) -> Result<Self, Box<Error>> {
        let file = File::open(path.as_ref()).map_err(|err| {
            Error::because(
                ErrorType::FileOpenError,
                "failed opening configuration file",
                err,
            )
        })?;
        let reader = BufReader::new(file);

        let conf: Self = serde_yaml::from_reader(reader).map_err(|err| {
            Error::because(
                ErrorType::FileReadError,
                "failed reading configuration file",
                err,
            )
        })?;
        trace!("Loaded configuration file: {conf:#?}");

        Ok(conf)
    }

    /// Parses the configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, Box<Error>> {
        serde_yaml::from_str(yaml).map_err(|err| {
            Error::because(
                ErrorType::FileReadError,
                "failed parsing configuration",
                err,
            )
        })
    }

    /// Loads the configuration file given on the command line if any and applies the command
    /// line overrides.
    pub fn from_opt(opt: &mut ServerOpt) -> Result<Self, Box<Error>> {
        let mut conf = match &opt.startup.conf {
            Some(path) => Self::load_from_yaml(path)?,
            None => Self::default(),
        };
        conf.access_log
            .merge_with_opt(std::mem::take(&mut opt.access_log));
        Ok(conf)
    }

    /// Creates a Pingora server running the given app on the configured addresses
    ///
    /// The access log pipeline held by `shutdown` is stopped when the server shuts down, so that
    /// queued log lines are written out.
    pub fn into_server<SV>(
        self,
        app: SV,
        shutdown: ShutdownService,
        opt: Option<StartupOpt>,
    ) -> Server
    where
        SV: ProxyHttp + Send + Sync + 'static,
        <SV as ProxyHttp>::CTX: Send + Sync,
    {
        let opt = opt.unwrap_or_default();

        let mut listen = opt.listen.unwrap_or(self.listen);
        if listen.is_empty() {
            // Make certain we have a listening address
            listen.push("127.0.0.1:8080".to_owned());
            listen.push("[::1]:8080".to_owned());
        }

        let server_conf = PingoraConf {
            threads: self.threads.max(1),
            ..Default::default()
        };

        let mut server = Server::new_with_opt_and_conf(
            PingoraOpt {
                daemon: opt.daemon,
                test: opt.test,
                upgrade: false,
                nocapture: false,
                conf: None,
            },
            server_conf,
        );
        server.bootstrap();

        let mut proxy = http_proxy_service(&server.configuration, app);
        for addr in listen {
            proxy.add_tcp(&addr);
        }
        server.add_service(proxy);
        server.add_service(background_service("access log shutdown", shutdown));

        server
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use clap::Parser;
    use test_log::test;

    #[test]
    fn defaults() {
        let conf = ServerConf::from_yaml("{}").unwrap();
        assert_eq!(conf, ServerConf::default());
        assert_eq!(conf.response, "OK\n");
        assert_eq!(conf.response_status, 200);
        assert!(conf.access_log.enabled);
    }

    #[test]
    fn parsing() {
        let conf = ServerConf::from_yaml(
            r#"
                listen: [127.0.0.1:9000]
                threads: 4
                response: "test"
                response_status: 404
                access_log:
                  config: pipeline.yaml
                  allow_reuse: false
                  resource_dirs: [/etc/access-log]
            "#,
        )
        .unwrap();
        assert_eq!(conf.listen, vec!["127.0.0.1:9000".to_owned()]);
        assert_eq!(conf.threads, 4);
        assert_eq!(conf.response, "test");
        assert_eq!(conf.response_status, 404);
        assert_eq!(conf.access_log.config.as_deref(), Some("pipeline.yaml"));
        assert!(!conf.access_log.allow_reuse);
        assert_eq!(
            conf.access_log.resource_dirs,
            vec![PathBuf::from("/etc/access-log")]
        );

        assert!(ServerConf::from_yaml("unknown_field: 1").is_err());
        assert!(ServerConf::from_yaml("access_log: {unknown_field: 1}").is_err());
    }

    #[test]
    fn command_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.yaml");
        std::fs::write(&path, "response: hi\naccess_log: {config: from-file.yaml}").unwrap();

        let path = path.to_string_lossy().into_owned();

        let mut opt = ServerOpt::parse_from([
            "access-log-server",
            "--listen",
            "127.0.0.1:1234",
            "--conf",
            path.as_str(),
            "--access-log-config",
            "from-cli.yaml",
            "--access-log-debug",
        ]);
        assert_eq!(opt.startup.listen, Some(vec!["127.0.0.1:1234".to_owned()]));

        let conf = ServerConf::from_opt(&mut opt).unwrap();
        assert_eq!(conf.response, "hi");
        assert_eq!(conf.access_log.config.as_deref(), Some("from-cli.yaml"));
        assert!(conf.access_log.debug);

        let mut opt = ServerOpt::parse_from(["access-log-server", "--conf", "does-not-exist.yaml"]);
        assert!(ServerConf::from_opt(&mut opt).is_err());
    }
}
