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

//! Sinks producing log lines, the actual writing happens on a separate thread

use chrono::{DateTime, Local};
use log::error;
use std::any::Any;
use std::fs::File;
use std::io::{stdout, Write};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{channel, Receiver, Sender, WeakSender};

use crate::configuration::LogField;
use crate::event::{AccessEvent, Endpoint};
use crate::sink::{Sink, SinkError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LogToken {
    None,
    RemoteAddr(Endpoint),
    RemotePort(Endpoint),
    RemoteName(String),
    Port(u16),
    TimeLocal,
    TimeISO,
    Request(String),
    Status(u16),
    BytesSent(u64),
    ProcessingTime(Duration),
    SequenceNumber(u64),
    Header(String),
}

#[derive(Debug)]
pub(crate) struct LogData {
    time: SystemTime,
    tokens: Vec<LogToken>,
}

#[derive(Debug)]
pub(crate) enum WriterMessage {
    Reopen,
    LogData(LogData),
}

impl WriterMessage {
    pub(crate) fn log_data(time: SystemTime, tokens: Vec<LogToken>) -> Self {
        Self::LogData(LogData { time, tokens })
    }
}

fn tokenize(event: &AccessEvent, format: &[LogField]) -> Vec<LogToken> {
    let mut tokens = Vec::with_capacity(format.len());
    for field in format {
        tokens.push(match field {
            LogField::None => LogToken::None,
            LogField::RemoteAddr => match event.remote_addr() {
                Some(addr) => LogToken::RemoteAddr(addr.clone()),
                None => LogToken::None,
            },
            LogField::RemotePort => match event.remote_addr() {
                Some(addr) => LogToken::RemotePort(addr.clone()),
                None => LogToken::None,
            },
            LogField::RemoteUser => match event.remote_user() {
                Some(user) => LogToken::RemoteName(user.to_owned()),
                None => LogToken::None,
            },
            LogField::ServerPort => match event.local_addr().and_then(Endpoint::port) {
                Some(port) => LogToken::Port(port),
                None => LogToken::None,
            },
            LogField::TimeLocal => LogToken::TimeLocal,
            LogField::TimeISO => LogToken::TimeISO,
            LogField::Request => LogToken::Request(event.request_line()),
            LogField::Status => match event.status() {
                0 => LogToken::None,
                status => LogToken::Status(status),
            },
            LogField::BytesSent => LogToken::BytesSent(event.content_length()),
            LogField::ProcessingTime => LogToken::ProcessingTime(event.elapsed()),
            LogField::SequenceNumber => LogToken::SequenceNumber(event.sequence_number()),
            LogField::RequestHeader(name) => match event.request_header(name.as_str()) {
                Some(value) => LogToken::Header(value.to_owned()),
                None => LogToken::None,
            },
            LogField::ResponseHeader(name) => match event.response_header(name.as_str()) {
                Some(value) => LogToken::Header(value.to_owned()),
                None => LogToken::None,
            },
            LogField::Cookie(name) => match event.cookie(name) {
                Some(value) => LogToken::Header(value.to_owned()),
                None => LogToken::None,
            },
        });
    }
    tokens
}

/// Where a writer sink puts its lines
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    /// Standard output
    Stdout,
    /// A file, data is appended
    File(PathBuf),
}

impl LogTarget {
    fn try_open(&self) -> Result<Box<dyn Write + Send>, std::io::Error> {
        match self {
            Self::Stdout => Ok(Box::new(stdout())),
            Self::File(path) => Ok(Box::new(
                File::options().append(true).create(true).open(path)?,
            )),
        }
    }

    fn open(&self) -> Box<dyn Write + Send> {
        match self.try_open() {
            Ok(writer) => writer,
            Err(err) => {
                if let Self::File(path) = self {
                    error!(
                        "Failed opening log file {} (cause: {err}), falling back to stdout",
                        path.as_os_str().to_string_lossy()
                    );
                }
                Box::new(stdout())
            }
        }
    }
}

fn normalize_path(path: PathBuf) -> Result<PathBuf, std::io::Error> {
    if let Some(parent) = path.parent() {
        let mut parent = if parent.as_os_str().is_empty() {
            PathBuf::from(".").canonicalize()
        } else {
            parent.canonicalize()
        }?;
        if let Some(name) = path.file_name() {
            parent.push(name);
        }
        Ok(parent)
    } else {
        // Absolute path in the root, leave unchanged
        Ok(path)
    }
}

fn write_escaped(buf: &mut Vec<u8>, data: impl AsRef<[u8]>) -> Result<(), std::io::Error> {
    fn is_allowed(byte: u8) -> bool {
        (b' '..=b'~').contains(&byte) && byte != b'"' && byte != b'\\'
    }

    buf.push(b'"');
    for byte in data.as_ref() {
        if is_allowed(*byte) {
            buf.push(*byte);
        } else {
            let _ = write!(buf, "\\x{byte:02x}");
        }
    }
    buf.push(b'"');

    Ok(())
}

fn stringify_data(buf: &mut Vec<u8>, time: SystemTime, tokens: Vec<LogToken>) {
    buf.truncate(0);

    for token in tokens {
        if !buf.is_empty() {
            let _ = write!(buf, " ");
        }
        let _ = match token {
            LogToken::None => write!(buf, "-"),
            LogToken::RemoteAddr(addr) => match addr.host() {
                Some(host) => write!(buf, "{host}"),
                None => write!(buf, "-"),
            },
            LogToken::RemotePort(addr) => match addr.port() {
                Some(port) => write!(buf, "{port}"),
                None => write!(buf, "-"),
            },
            LogToken::RemoteName(remote_name) => write_escaped(buf, remote_name),
            LogToken::Port(port) => write!(buf, "{port}"),
            LogToken::TimeLocal => {
                let time = DateTime::<Local>::from(time).format("%d/%b/%Y:%H:%M:%S %z");
                write!(buf, "[{time}]")
            }
            LogToken::TimeISO => {
                let time = DateTime::<Local>::from(time).to_rfc3339();
                write!(buf, "[{time}]")
            }
            LogToken::Request(request) => write_escaped(buf, request),
            LogToken::Status(status) => write!(buf, "{status}"),
            LogToken::BytesSent(bytes) => write!(buf, "{bytes}"),
            LogToken::ProcessingTime(time) => {
                write!(buf, "{:.3}", time.as_secs_f32() * 1000.0)
            }
            LogToken::SequenceNumber(number) => write!(buf, "{number}"),
            LogToken::Header(value) => write_escaped(buf, value),
        };
    }
    let _ = writeln!(buf);
}

pub(crate) async fn log_writer(
    target: LogTarget,
    mut writer: Box<dyn Write + Send>,
    mut receiver: Receiver<WriterMessage>,
) {
    let mut buf = Vec::<u8>::with_capacity(4096);

    while let Some(data) = receiver.recv().await {
        match data {
            WriterMessage::Reopen => {
                let _ = writer.flush();
                writer = target.open();
            }
            WriterMessage::LogData(data) => {
                stringify_data(&mut buf, data.time, data.tokens);
                if let Err(err) = writer.write_all(&buf) {
                    error!("Failed writing access log line: {err}");
                }
            }
        }
    }

    let _ = writer.flush();
}

fn spawn_writer(
    name: &str,
    target: LogTarget,
    writer: Box<dyn Write + Send>,
    receiver: Receiver<WriterMessage>,
    signal_sender: WeakSender<WriterMessage>,
) -> Result<JoinHandle<()>, std::io::Error> {
    std::thread::Builder::new()
        .name(format!("access-log-{name}"))
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    error!("Failed creating runtime for access log writer: {err}");
                    return;
                }
            };

            runtime.block_on(async move {
                #[cfg(unix)]
                crate::signal::listen(&signal_sender);
                #[cfg(not(unix))]
                drop(signal_sender);

                log_writer(target, writer, receiver).await
            });
        })
}

#[derive(Debug)]
struct WriterState {
    sender: Sender<WriterMessage>,
    thread: JoinHandle<()>,
}

/// Sink formatting events as lines and writing them to standard output or a file
///
/// Formatting into tokens happens on the calling thread, stringifying and writing on a dedicated
/// writer thread. Appending never blocks: if the writer falls behind by more than the queue size,
/// events are dropped with [`SinkError::QueueFull`].
///
/// On Unix-based systems, the process can be sent a `HUP` or `USR1` signal to make it re-open
/// log files. This is useful after the logs have been rotated for example.
#[derive(Debug)]
pub struct WriterSink {
    name: String,
    target: LogTarget,
    format: Vec<LogField>,
    queue_size: usize,
    state: RwLock<Option<WriterState>>,
}

impl WriterSink {
    fn new(name: String, target: LogTarget, format: Vec<LogField>, queue_size: usize) -> Self {
        let format = if format.is_empty() {
            LogField::default_format()
        } else {
            format
        };

        Self {
            name,
            target,
            format,
            queue_size: queue_size.max(1),
            state: RwLock::default(),
        }
    }

    /// Creates a sink writing to standard output
    pub fn console(name: impl Into<String>, format: Vec<LogField>, queue_size: usize) -> Self {
        Self::new(name.into(), LogTarget::Stdout, format, queue_size)
    }

    /// Creates a sink appending to a file, the special path `-` means standard output.
    pub fn file(
        name: impl Into<String>,
        path: impl AsRef<Path>,
        format: Vec<LogField>,
        queue_size: usize,
    ) -> Self {
        let path = path.as_ref();
        let target = if path.as_os_str() == "-" {
            LogTarget::Stdout
        } else {
            LogTarget::File(path.to_owned())
        };
        Self::new(name.into(), target, format, queue_size)
    }

    /// The configured target
    pub fn target(&self) -> &LogTarget {
        &self.target
    }

    /// The fields of each line
    pub fn format(&self) -> &[LogField] {
        &self.format
    }

    fn writer_state(
        &self,
        target: LogTarget,
        writer: Box<dyn Write + Send>,
    ) -> Result<WriterState, SinkError> {
        let (sender, receiver) = channel(self.queue_size);
        let thread = spawn_writer(&self.name, target, writer, receiver, sender.downgrade())
            .map_err(|err| self.io_error(err))?;
        Ok(WriterState { sender, thread })
    }

    /// Starts the writer thread with a custom writer instead of opening the target
    #[cfg(test)]
    pub(crate) fn start_with_writer(
        &self,
        writer: Box<dyn Write + Send>,
    ) -> Result<(), SinkError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        *state = Some(self.writer_state(self.target.clone(), writer)?);
        Ok(())
    }

    fn io_error(&self, source: std::io::Error) -> SinkError {
        SinkError::Io {
            name: self.name.clone(),
            source,
        }
    }
}

impl Sink for WriterSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self) -> Result<(), SinkError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.is_some() {
            return Ok(());
        }

        // Normalize parent directory in case the same file is specified with different paths
        let target = match &self.target {
            LogTarget::File(path) => {
                LogTarget::File(normalize_path(path.clone()).map_err(|err| self.io_error(err))?)
            }
            LogTarget::Stdout => LogTarget::Stdout,
        };
        let writer = target.try_open().map_err(|err| self.io_error(err))?;

        *state = Some(self.writer_state(target, writer)?);
        Ok(())
    }

    fn append(&self, event: &AccessEvent) -> Result<(), SinkError> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let Some(state) = state.as_ref() else {
            return Err(SinkError::NotStarted(self.name.clone()));
        };

        let message = WriterMessage::log_data(event.timestamp(), tokenize(event, &self.format));
        state.sender.try_send(message).map_err(|err| match err {
            TrySendError::Full(_) => SinkError::QueueFull(self.name.clone()),
            TrySendError::Closed(_) => SinkError::Disconnected(self.name.clone()),
        })
    }

    fn stop(&self) {
        let state = self
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(WriterState { sender, thread }) = state {
            // Closing the channel lets the writer drain the queue and exit
            drop(sender);
            if thread.join().is_err() {
                error!("Access log writer of sink {} crashed", self.name);
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
