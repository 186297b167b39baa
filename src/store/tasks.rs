//! Per-fragment transfer tasks
//!
//! Each task moves exactly one fragment and is spawned on the tokio runtime.
//! Fragments travel between spool files and backends as streams.
//! Tasks never retry; the orchestrator decides what a failure means.

use std::collections::VecDeque;
use std::fs::File;
use std::io::Seek;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::debug;

use super::spool;
use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::metadata::SliceMetadata;

/// Backends not yet claimed by this upload's fragments
pub(crate) type BackendQueue = Arc<Mutex<VecDeque<Arc<dyn Backend>>>>;

/// Result of one placement attempt
#[derive(Debug)]
pub(crate) struct Placement {
    /// Position of the fragment, data first
    pub position: usize,
    /// Backend that was tried, if any was left
    pub backend_id: Option<String>,
    pub result: Result<u64>,
}

/// Result of one retrieval: the fragment spooled to a rewound file
#[derive(Debug)]
pub(crate) struct Retrieval {
    pub position: usize,
    pub backend_id: String,
    pub result: Result<File>,
}

/// Result of one fragment delete
#[derive(Debug)]
pub(crate) struct Removal {
    pub slice_id: String,
    pub backend_id: String,
    pub result: Result<()>,
}

async fn permit(transfers: &Arc<Semaphore>) -> Result<tokio::sync::OwnedSemaphorePermit> {
    Arc::clone(transfers)
        .acquire_owned()
        .await
        .map_err(|_| Error::Internal("transfer limiter closed".to_string()))
}

/// Claim one backend from the queue and stream the spooled fragment there.
///
/// Exactly one attempt: a failed put is not retried on another backend, so
/// no backend ever holds two fragments of the same upload.
pub(crate) fn spawn_placement(
    position: usize,
    blob_id: String,
    fragment: File,
    length: u64,
    queue: BackendQueue,
    transfers: Arc<Semaphore>,
) -> JoinHandle<Placement> {
    tokio::spawn(async move {
        let backend = queue.lock().pop_front();
        let Some(backend) = backend else {
            return Placement {
                position,
                backend_id: None,
                result: Err(Error::BackendUnavailable(
                    "no backend left for fragment".to_string(),
                )),
            };
        };

        let backend_id = backend.id().to_string();
        let result = match permit(&transfers).await {
            Ok(_permit) => {
                debug!(
                    "Placing fragment {} ({} bytes) on {}",
                    blob_id, length, backend_id
                );
                let mut source = tokio::fs::File::from_std(fragment);
                backend.put(&blob_id, &mut source, length).await
            }
            Err(e) => Err(e),
        };

        Placement {
            position,
            backend_id: Some(backend_id),
            result,
        }
    })
}

/// Fetch one fragment into a spool file and check it against its metadata
pub(crate) fn spawn_retrieval(
    in_flight: &mut JoinSet<Retrieval>,
    position: usize,
    slice: SliceMetadata,
    backend: Arc<dyn Backend>,
    verify_checksum: bool,
    spool_dir: Option<PathBuf>,
    transfers: Arc<Semaphore>,
) {
    in_flight.spawn(async move {
        let backend_id = backend.id().to_string();
        let result = async {
            let _permit = permit(&transfers).await?;
            debug!("Fetching fragment {} from {}", slice.id, backend_id);

            let mut sink = tokio::fs::File::from_std(spool::spool_file(spool_dir.as_deref())?);
            let received = backend.get(&slice.id, &mut sink).await?;
            sink.flush().await?;

            if received != slice.size {
                return Err(Error::backend(
                    &backend_id,
                    format!(
                        "fragment {} is {} bytes, expected {}",
                        slice.id, received, slice.size
                    ),
                ));
            }

            let mut file = sink.into_std().await;
            file.rewind()?;
            if verify_checksum {
                let got = spool::checksum_of(&mut file)?;
                if got != slice.checksum {
                    return Err(Error::ChecksumMismatch {
                        slice: slice.id.clone(),
                        expected: slice.checksum.clone(),
                        got,
                    });
                }
                file.rewind()?;
            }
            Ok::<_, Error>(file)
        }
        .await;

        Retrieval {
            position,
            backend_id,
            result,
        }
    });
}

/// Delete one fragment
pub(crate) fn spawn_removal(
    slice_id: String,
    backend: Arc<dyn Backend>,
    transfers: Arc<Semaphore>,
) -> JoinHandle<Removal> {
    tokio::spawn(async move {
        let backend_id = backend.id().to_string();
        let result = match permit(&transfers).await {
            Ok(_permit) => {
                debug!("Deleting fragment {} from {}", slice_id, backend_id);
                backend.delete(&slice_id).await
            }
            Err(e) => Err(e),
        };

        Removal {
            slice_id,
            backend_id,
            result,
        }
    })
}

/// Map a panicked or cancelled task to an error
pub(crate) fn join_error(e: tokio::task::JoinError) -> Error {
    Error::Internal(format!("fragment task failed: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::metadata::FragmentKind;
    use std::io::{Read, Write};

    fn queue_of(backends: Vec<Arc<MemoryBackend>>) -> BackendQueue {
        Arc::new(Mutex::new(
            backends
                .into_iter()
                .map(|b| b as Arc<dyn Backend>)
                .collect(),
        ))
    }

    fn spooled(data: &[u8]) -> File {
        let mut file = spool::spool_file(None).unwrap();
        file.write_all(data).unwrap();
        file.rewind().unwrap();
        file
    }

    #[tokio::test]
    async fn test_each_placement_claims_its_own_backend() {
        let a = Arc::new(MemoryBackend::new("a", 1024));
        let b = Arc::new(MemoryBackend::new("b", 1024));
        let queue = queue_of(vec![Arc::clone(&a), Arc::clone(&b)]);
        let transfers = Arc::new(Semaphore::new(4));

        let handles: Vec<_> = [b"x", b"y", b"z"]
            .iter()
            .enumerate()
            .map(|(position, data)| {
                spawn_placement(
                    position,
                    format!("f{}", position),
                    spooled(*data),
                    1,
                    Arc::clone(&queue),
                    Arc::clone(&transfers),
                )
            })
            .collect();

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        results.sort_by_key(|p| p.position);

        let used: Vec<_> = results.iter().filter_map(|p| p.backend_id.clone()).collect();
        assert_eq!(used.len(), 2);
        assert_ne!(used[0], used[1]);
        assert_eq!(a.blob_count() + b.blob_count(), 2);

        // One fragment found the queue empty
        assert_eq!(results.iter().filter(|p| p.result.is_err()).count(), 1);
    }

    #[tokio::test]
    async fn test_placement_streams_spooled_fragment() {
        let backend = Arc::new(MemoryBackend::new("a", 1024));
        let placement = spawn_placement(
            0,
            "frag".to_string(),
            spooled(b"spooled fragment"),
            16,
            queue_of(vec![Arc::clone(&backend)]),
            Arc::new(Semaphore::new(1)),
        )
        .await
        .unwrap();

        assert_eq!(placement.result.unwrap(), 16);
        assert_eq!(backend.get_bytes("frag").await.unwrap(), b"spooled fragment");
    }

    #[tokio::test]
    async fn test_retrieval_detects_corruption() {
        let backend = Arc::new(MemoryBackend::new("a", 1024));
        let slice = SliceMetadata::new("obj", FragmentKind::Data, 0, b"good");
        backend.put_bytes(&slice.id, b"evil").await.unwrap();
        let transfers = Arc::new(Semaphore::new(1));

        let mut in_flight = JoinSet::new();
        spawn_retrieval(
            &mut in_flight,
            0,
            slice.clone(),
            Arc::clone(&backend) as Arc<dyn Backend>,
            true,
            None,
            Arc::clone(&transfers),
        );
        let checked = in_flight.join_next().await.unwrap().unwrap();
        assert!(matches!(checked.result, Err(Error::ChecksumMismatch { .. })));

        spawn_retrieval(&mut in_flight, 0, slice, backend, false, None, transfers);
        let unchecked = in_flight.join_next().await.unwrap().unwrap();
        let mut contents = Vec::new();
        unchecked.result.unwrap().read_to_end(&mut contents).unwrap();
        assert_eq!(contents, b"evil");
    }

    #[tokio::test]
    async fn test_retrieval_spools_verified_fragment() {
        let backend = Arc::new(MemoryBackend::new("a", 1024));
        let slice = SliceMetadata::new("obj", FragmentKind::Data, 2, b"intact");
        backend.put_bytes(&slice.id, b"intact").await.unwrap();

        let mut in_flight = JoinSet::new();
        spawn_retrieval(&mut in_flight, 2, slice, backend, true, None, Arc::new(Semaphore::new(1)));
        let retrieval = in_flight.join_next().await.unwrap().unwrap();

        let mut contents = Vec::new();
        retrieval.result.unwrap().read_to_end(&mut contents).unwrap();
        assert_eq!(contents, b"intact");
    }

    #[tokio::test]
    async fn test_retrieval_rejects_wrong_size() {
        let backend = Arc::new(MemoryBackend::new("a", 1024));
        let slice = SliceMetadata::new("obj", FragmentKind::Coding, 1, b"four");
        backend.put_bytes(&slice.id, b"three").await.unwrap();

        let mut in_flight = JoinSet::new();
        spawn_retrieval(
            &mut in_flight,
            3,
            slice,
            backend,
            false,
            None,
            Arc::new(Semaphore::new(1)),
        );
        let retrieval = in_flight.join_next().await.unwrap().unwrap();
        assert_eq!(retrieval.position, 3);
        assert!(matches!(retrieval.result, Err(Error::Backend { .. })));
    }

    #[tokio::test]
    async fn test_removal_reports_backend_errors() {
        let backend = Arc::new(MemoryBackend::new("a", 1024));
        backend.set_available(false);
        let removal = spawn_removal("blob".to_string(), backend, Arc::new(Semaphore::new(1)))
            .await
            .unwrap();
        assert_eq!(removal.backend_id, "a");
        assert!(removal.result.is_err());
    }
}
