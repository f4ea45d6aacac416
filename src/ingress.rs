//! Event intake.
//!
//! Listens on a unix socket for NDJSON webhook deliveries and partitions
//! them onto lanes by a stable hash of the user id, so one user's events
//! are always handled in order by the same lane.

use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::engine::event::{user_seed, Event};

#[derive(Debug, Error)]
pub enum IngressError {
    #[error("unable to bind socket {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("refusing to replace non-socket file at {0}")]
    NotASocket(PathBuf),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One raw log entry addressed to a lane.
#[derive(Debug, Clone, PartialEq)]
pub struct IngressEntry {
    pub user: String,
    pub raw: String,
}

/// Stable user-to-lane assignment.
pub fn lane_for(user: &str, lanes: usize) -> usize {
    if lanes <= 1 {
        return 0;
    }
    (user_seed(user) % lanes as u64) as usize
}

fn prepare_socket_path(path: &Path) -> Result<(), IngressError> {
    match fs::metadata(path) {
        Ok(metadata) if metadata.file_type().is_socket() => {
            fs::remove_file(path)?;
            Ok(())
        }
        Ok(_) => Err(IngressError::NotASocket(path.to_path_buf())),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error.into()),
    }
}

/// Events that cannot name a user still need a lane so their corrupted-
/// message report goes out; they all land on lane 0 under this name.
const UNATTRIBUTED_USER: &str = "unknown";

fn route(raw: &str) -> IngressEntry {
    let user = Event::parse(raw)
        .ok()
        .and_then(|event| event.user_id().map(String::from))
        .unwrap_or_else(|| UNATTRIBUTED_USER.to_string());
    IngressEntry {
        user,
        raw: raw.to_string(),
    }
}

async fn handle_client(stream: UnixStream, lanes: Vec<mpsc::Sender<IngressEntry>>) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(error) => {
                tracing::warn!(target: "ingress", error = %error, "client_read_failed");
                return;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let entry = route(line);
        let lane = lane_for(&entry.user, lanes.len());
        if lanes[lane].send(entry).await.is_err() {
            tracing::warn!(target: "ingress", lane, "lane_closed");
            return;
        }
    }
}

pub struct SocketIngress {
    path: PathBuf,
}

impl SocketIngress {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Accept clients until `shutdown` fires, feeding each NDJSON line to
    /// its lane. Lane channels apply backpressure to slow producers down
    /// rather than dropping events.
    pub async fn run(
        &self,
        lanes: Vec<mpsc::Sender<IngressEntry>>,
        shutdown: CancellationToken,
    ) -> Result<(), IngressError> {
        prepare_socket_path(&self.path)?;
        let listener = UnixListener::bind(&self.path).map_err(|source| IngressError::Bind {
            path: self.path.clone(),
            source,
        })?;
        tracing::info!(target: "ingress", path = %self.path.display(), "listening");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let lanes = lanes.clone();
                        let client_shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = client_shutdown.cancelled() => {}
                                _ = handle_client(stream, lanes) => {}
                            }
                        });
                    }
                    Err(error) => {
                        tracing::warn!(target: "ingress", error = %error, "accept_failed");
                    }
                },
            }
        }

        if let Err(error) = fs::remove_file(&self.path) {
            if error.kind() != ErrorKind::NotFound {
                tracing::warn!(target: "ingress", error = %error, "socket_cleanup_failed");
            }
        }
        Ok(())
    }
}
