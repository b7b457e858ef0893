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

//! Command line entry point of Access Log Server

use access_log_module::ConfigurationLoader;
use access_log_server::{ServerConf, ServerOpt, ShutdownService, StaticResponseApp};
use clap::Parser;
use log::error;
use std::process::ExitCode;
use std::sync::Arc;

#[allow(unreachable_code)]
fn main() -> ExitCode {
    env_logger::init();

    let mut opt = ServerOpt::parse();

    let conf = match ServerConf::from_opt(&mut opt) {
        Ok(conf) => conf,
        Err(err) => {
            error!("{err}");
            return ExitCode::FAILURE;
        }
    };

    // Access log configuration problems are fatal, the server doesn't start without its log
    let loader = Arc::new(ConfigurationLoader::from_conf(&conf.access_log));
    let app = match StaticResponseApp::from_conf(&conf, &loader) {
        Ok(app) => app,
        Err(err) => {
            error!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let server = conf.into_server(app, ShutdownService::new(loader), Some(opt.startup));
    server.run_forever();
    ExitCode::SUCCESS
}
