//! The two concrete byte sinks.
//!
//! Ownership: the coordinator's writer task owns the sink from first write
//! to terminal state. A file sink is opened (and on failure removed) by the
//! coordinator itself; a stream sink is a bounded channel whose receiver
//! side the caller drives, so a full channel is the backpressure signal.

use crate::error::Error;
use bytes::Bytes;
use std::path::PathBuf;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

pub(crate) enum SinkDest {
    File { file: File, path: PathBuf },
    Stream { tx: mpsc::Sender<Result<Bytes, Error>> },
}

impl SinkDest {
    pub(crate) async fn open_file(path: PathBuf) -> Result<Self, Error> {
        let file = File::create(&path)
            .await
            .map_err(|e| Error::Io { detail: format!("create {}: {e}", path.display()) })?;
        Ok(SinkDest::File { file, path })
    }

    pub(crate) fn stream(tx: mpsc::Sender<Result<Bytes, Error>>) -> Self {
        SinkDest::Stream { tx }
    }

    /// Deliver one in-order chunk. Completion means the sink accepted the
    /// bytes; a stream sink at capacity suspends here until the consumer
    /// drains.
    pub(crate) async fn write(&mut self, bytes: Bytes) -> Result<(), Error> {
        match self {
            SinkDest::File { file, path } => {
                file.write_all(&bytes)
                    .await
                    .map_err(|e| Error::Io { detail: format!("write {}: {e}", path.display()) })
            }
            SinkDest::Stream { tx } => {
                // A dropped receiver means the consumer walked away.
                tx.send(Ok(bytes)).await.map_err(|_| Error::cancelled())
            }
        }
    }

    pub(crate) async fn close(self) -> Result<(), Error> {
        match self {
            SinkDest::File { mut file, path } => file
                .shutdown()
                .await
                .map_err(|e| Error::Io { detail: format!("close {}: {e}", path.display()) }),
            SinkDest::Stream { tx } => {
                drop(tx);
                Ok(())
            }
        }
    }

    /// Destroy the sink with a terminal error: a partial file is removed, a
    /// stream consumer receives the error as its final item.
    pub(crate) async fn fail(self, error: Error) {
        match self {
            SinkDest::File { file, path } => {
                drop(file);
                let _ = tokio::fs::remove_file(&path).await;
            }
            SinkDest::Stream { tx } => {
                let _ = tx.send(Err(error)).await;
            }
        }
    }
}
