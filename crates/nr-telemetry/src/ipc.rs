// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Named pipe the agent writes telemetry to.
//!
//! The agent opens the pipe, writes one complete envelope and closes it. A dedicated thread
//! blocks on opening the read side, reads until EOF and forwards the bytes to the main loop,
//! which polls the channel without waiting.

use std::path::Path;
use std::thread::JoinHandle;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::errors::IngressError;

/// Opens the telemetry pipe at `path`, replacing any stale file, and starts the reader thread.
///
/// The thread stops after the receiver is dropped, once the next message has been read.
pub fn init_telemetry_channel(
    path: &Path,
) -> Result<(mpsc::Receiver<Bytes>, JoinHandle<()>), IngressError> {
    imp::create_pipe(path)?;

    let (tx, rx) = mpsc::channel(1);
    let pipe_path = path.to_path_buf();
    let handle = std::thread::Builder::new()
        .name("telemetry-pipe-reader".to_string())
        .spawn(move || imp::read_loop(&pipe_path, &tx))
        .map_err(IngressError::Spawn)?;

    Ok((rx, handle))
}

#[cfg(unix)]
mod imp {
    use std::fs::File;
    use std::io::Read;
    use std::path::Path;
    use std::time::Duration;

    use bytes::Bytes;
    use nix::sys::stat::Mode;
    use tokio::sync::mpsc;
    use tracing::{debug, error};

    use crate::errors::IngressError;

    const VISIBILITY_RETRIES: u32 = 10;
    const VISIBILITY_RETRY_DELAY: Duration = Duration::from_millis(10);
    const READ_ERROR_DELAY: Duration = Duration::from_millis(100);

    pub(super) fn create_pipe(path: &Path) -> Result<(), IngressError> {
        let _ = std::fs::remove_file(path);

        nix::unistd::mkfifo(path, Mode::from_bits_truncate(0o666)).map_err(|errno| {
            IngressError::Create {
                path: path.display().to_string(),
                source: std::io::Error::from(errno),
            }
        })?;

        // the special file must be visible before the reader tries to open it
        for _ in 0..=VISIBILITY_RETRIES {
            if path.exists() {
                return Ok(());
            }
            std::thread::sleep(VISIBILITY_RETRY_DELAY);
        }
        Err(IngressError::NotVisible(path.display().to_string()))
    }

    pub(super) fn read_loop(path: &Path, tx: &mpsc::Sender<Bytes>) {
        loop {
            let data = match read_message(path) {
                Ok(data) => data,
                Err(e) => {
                    error!("Failed to read telemetry pipe {}: {e}", path.display());
                    std::thread::sleep(READ_ERROR_DELAY);
                    continue;
                }
            };
            if data.is_empty() {
                debug!("Empty write on telemetry pipe, ignoring");
                continue;
            }
            debug!("Read {} bytes of telemetry", data.len());
            if tx.blocking_send(Bytes::from(data)).is_err() {
                debug!("Telemetry receiver dropped, stopping pipe reader");
                return;
            }
        }
    }

    fn read_message(path: &Path) -> std::io::Result<Vec<u8>> {
        // blocks until a writer opens the other end, EOF once it closes
        let mut pipe = File::open(path)?;
        let mut data = Vec::new();
        pipe.read_to_end(&mut data)?;
        Ok(data)
    }
}

#[cfg(not(unix))]
mod imp {
    use std::path::Path;

    use bytes::Bytes;
    use tokio::sync::mpsc;

    use crate::errors::IngressError;

    pub(super) fn create_pipe(_path: &Path) -> Result<(), IngressError> {
        Err(IngressError::Unsupported)
    }

    pub(super) fn read_loop(_path: &Path, _tx: &mpsc::Sender<Bytes>) {}
}
