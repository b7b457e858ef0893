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

//! Unix signals making writer threads re-open their log files

use log::{error, warn};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc::WeakSender;

use crate::writer::WriterMessage;

fn listen_to_signal(kind: SignalKind, sender: WeakSender<WriterMessage>) {
    tokio::spawn(async move {
        let mut sig = match signal(kind) {
            Ok(sig) => sig,
            Err(err) => {
                warn!(
                    "Failed registering for signal {}: {err}",
                    kind.as_raw_value()
                );
                return;
            }
        };

        while sig.recv().await.is_some() {
            // The sink has been stopped once the last strong sender is gone
            let Some(sender) = sender.upgrade() else {
                break;
            };
            if let Err(err) = sender.send(WriterMessage::Reopen).await {
                error!("Failed reopening log files, writer thread crashed? {err}");
            }
        }
    });
}

/// Makes the writer re-open its log file on `HUP` and `USR1` signals. Only a weak sender is kept,
/// so listening doesn't prevent the writer from shutting down.
pub(crate) fn listen(sender: &WeakSender<WriterMessage>) {
    listen_to_signal(SignalKind::hangup(), sender.clone());
    listen_to_signal(SignalKind::user_defined1(), sender.clone());
}
