//! Distributed object store
//!
//! Encodes objects into `k + m` fragments and spreads them over the
//! registry's backends, one fragment per backend. Downloads need any `k`
//! fragments. Each successful upload is a new placement epoch; the previous
//! epoch's fragments are deleted only after the new record is persisted.

use std::collections::VecDeque;
use std::io::{BufReader, BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::spool::{self, FragmentWriter};
use super::tasks::{self, BackendQueue, Retrieval};
use crate::backend::{Backend, BackendRegistry, TransferKind};
use crate::config::Config;
use crate::erasure::{CodingScheme, StreamingCodec};
use crate::error::{Error, Result};
use crate::metadata::{FragmentKind, SliceMetadata, UploadRecord, UploadRepository};

/// A fragment to fetch: position, metadata, holder
type RetrievalJob = (usize, SliceMetadata, Arc<dyn Backend>);

/// Default limit on fragment transfers in flight
const DEFAULT_MAX_CONCURRENT_TRANSFERS: usize = 16;

/// Erasure-coded store over a pool of backends
pub struct DistributedStore {
    id: String,
    codec: StreamingCodec,
    registry: Arc<dyn BackendRegistry>,
    repository: Arc<dyn UploadRepository>,
    transfers: Arc<Semaphore>,
    required_placements: usize,
    verify_checksums: bool,
    spool_dir: Option<PathBuf>,
}

impl DistributedStore {
    /// Store requiring all `k + m` placements per upload
    pub fn new(
        id: impl Into<String>,
        codec: StreamingCodec,
        registry: Arc<dyn BackendRegistry>,
        repository: Arc<dyn UploadRepository>,
    ) -> Self {
        let required_placements = codec.scheme().total();
        Self {
            id: id.into(),
            codec,
            registry,
            repository,
            transfers: Arc::new(Semaphore::new(DEFAULT_MAX_CONCURRENT_TRANSFERS)),
            required_placements,
            verify_checksums: true,
            spool_dir: None,
        }
    }

    /// Build from configuration
    pub fn from_config(
        config: &Config,
        registry: Arc<dyn BackendRegistry>,
        repository: Arc<dyn UploadRepository>,
    ) -> Result<Self> {
        config.validate()?;
        let scheme = CodingScheme::from_config(&config.erasure)?;
        let codec = StreamingCodec::new(Arc::new(scheme), config.codec.window_size)?;

        let store = Self::new("cloudraid", codec, registry, repository)
            .with_required_placements(config.required_placements())?
            .with_max_concurrent_transfers(config.store.max_concurrent_transfers)?
            .with_checksum_verification(config.store.verify_checksums)
            .with_spool_dir(config.store.spool_dir.clone());
        Ok(store)
    }

    /// Accept uploads that place at least `required` fragments.
    ///
    /// Must lie in `[k, k + m]`. Fragments that fail to place are recorded
    /// without a backend and read back as erased.
    pub fn with_required_placements(mut self, required: usize) -> Result<Self> {
        let scheme = self.codec.scheme();
        if required < scheme.k() || required > scheme.total() {
            return Err(Error::InvalidConfig(format!(
                "required placements must be between {} and {}, got {}",
                scheme.k(),
                scheme.total(),
                required
            )));
        }
        self.required_placements = required;
        Ok(self)
    }

    pub fn with_max_concurrent_transfers(mut self, limit: usize) -> Result<Self> {
        if limit == 0 {
            return Err(Error::InvalidConfig(
                "max concurrent transfers must be greater than 0".to_string(),
            ));
        }
        self.transfers = Arc::new(Semaphore::new(limit));
        Ok(self)
    }

    pub fn with_checksum_verification(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }

    /// Directory for fragment spool files; the system temp dir when `None`
    pub fn with_spool_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.spool_dir = dir;
        self
    }

    pub fn codec(&self) -> &StreamingCodec {
        &self.codec
    }

    pub fn required_placements(&self) -> usize {
        self.required_placements
    }

    /// Store `length` bytes from `source` as the object's new placement epoch
    pub async fn upload<R: Read + Send>(
        &self,
        object_id: &str,
        source: &mut R,
        length: u64,
    ) -> Result<UploadRecord> {
        let scheme = self.codec.scheme();
        let (k, total) = (scheme.k(), scheme.total());

        // Fragments are spooled to disk window by window
        let mut sinks = Vec::with_capacity(total);
        for _ in 0..total {
            sinks.push(FragmentWriter::new(spool::spool_file(self.spool_dir())?));
        }
        let fragment_size = self.codec.encode_windowed(source, length, &mut sinks)?;

        let mut data_slices = Vec::with_capacity(k);
        let mut coding_slices = Vec::with_capacity(total - k);
        let mut fragments = Vec::with_capacity(total);
        for (position, sink) in sinks.into_iter().enumerate() {
            let spooled = sink.finish()?;
            let (kind, index) = if position < k {
                (FragmentKind::Data, position)
            } else {
                (FragmentKind::Coding, position - k)
            };
            let slice = SliceMetadata::with_checksum(
                object_id,
                kind,
                index,
                spooled.size,
                spooled.checksum,
            );
            match kind {
                FragmentKind::Data => data_slices.push(slice),
                FragmentKind::Coding => coding_slices.push(slice),
            }
            fragments.push(spooled.file);
        }
        let mut record = UploadRecord::new(
            object_id,
            length,
            fragment_size,
            data_slices,
            coding_slices,
        );

        let queue: BackendQueue = Arc::new(Mutex::new(self.registry.list().into()));
        let handles: Vec<_> = record
            .slices()
            .map(|s| s.id.clone())
            .zip(fragments)
            .enumerate()
            .map(|(position, (blob_id, fragment))| {
                tasks::spawn_placement(
                    position,
                    blob_id,
                    fragment,
                    fragment_size,
                    Arc::clone(&queue),
                    Arc::clone(&self.transfers),
                )
            })
            .collect();

        let mut placed = 0;
        for joined in join_all(handles).await {
            let placement = match joined {
                Ok(placement) => placement,
                Err(e) => {
                    error!("Placement task for {} failed: {}", object_id, e);
                    continue;
                }
            };

            match (placement.result, placement.backend_id) {
                (Ok(_), Some(backend_id)) => {
                    self.registry.record_success(&backend_id, TransferKind::Upload);
                    if let Some(slice) = record.slices_mut().nth(placement.position) {
                        slice.backend_id = Some(backend_id);
                    }
                    placed += 1;
                }
                (Err(e), Some(backend_id)) => {
                    warn!(
                        "Fragment {} of {} not placed on {}: {}",
                        placement.position, object_id, backend_id, e
                    );
                    self.registry.record_failure(&backend_id, &e);
                }
                (result, None) => {
                    warn!(
                        "Fragment {} of {} not placed: {:?}",
                        placement.position,
                        object_id,
                        result.err()
                    );
                }
            }
        }

        if placed < self.required_placements {
            error!(
                "Upload of {} failed: {}/{} fragments placed",
                object_id, placed, self.required_placements
            );
            let audit = self.repository.insert(&record);
            self.delete_fragments(&record).await;
            if let Err(e) = audit {
                error!("Failed to record failed upload of {}: {}", object_id, e);
                return Err(e);
            }
            return Err(Error::UploadIncomplete {
                placed,
                required: self.required_placements,
            });
        }

        self.commit(record).await
    }

    /// Convenience wrapper around [`upload`](Self::upload) for in-memory data
    pub async fn upload_bytes(&self, object_id: &str, data: &[u8]) -> Result<UploadRecord> {
        let mut source = data;
        self.upload(object_id, &mut source, data.len() as u64).await
    }

    /// Persist a fully placed record, then retire the previous epoch
    async fn commit(&self, mut record: UploadRecord) -> Result<UploadRecord> {
        let previous = match self.repository.find_current(&record.object_id) {
            Ok(previous) => previous,
            Err(e) => {
                error!(
                    "Could not look up current epoch of {}: {}",
                    record.object_id, e
                );
                self.delete_fragments(&record).await;
                return Err(e);
            }
        };

        // The new epoch must sort after the one it replaces
        if let Some(prev) = &previous {
            let earliest = prev.timestamp + Duration::microseconds(1);
            if record.timestamp < earliest {
                record.timestamp = earliest;
            }
        }
        record.success = true;

        if let Err(e) = self.repository.insert(&record) {
            error!(
                "Failed to persist upload record of {}: {}",
                record.object_id, e
            );
            self.delete_fragments(&record).await;
            return Err(e);
        }

        info!(
            "Uploaded {} ({} bytes, {} fragments of {} bytes)",
            record.object_id,
            record.data_size,
            record.placed_count(),
            record.fragment_size
        );

        // Every older epoch is garbage now, including any an earlier commit
        // failed to retire
        match self.repository.find_by_object(&record.object_id) {
            Ok(records) => {
                for old in records {
                    if old.success && old.id != record.id && old.timestamp < record.timestamp {
                        self.retire(old).await;
                    }
                }
            }
            Err(e) => warn!(
                "Could not list superseded epochs of {}: {}",
                record.object_id, e
            ),
        }

        Ok(record)
    }

    /// Delete a superseded epoch's fragments, then its record
    async fn retire(&self, record: UploadRecord) {
        debug!("Retiring epoch {} of {}", record.id, record.object_id);
        self.delete_fragments(&record).await;
        if let Err(e) = self.remove_record(record) {
            warn!("Superseded epoch not removed: {}", e);
        }
    }

    /// Remove a record. If that fails the record is at least marked
    /// unsuccessful so it can never become current again.
    fn remove_record(&self, mut record: UploadRecord) -> Result<()> {
        let Err(e) = self.repository.delete(&record.id) else {
            return Ok(());
        };
        warn!("Failed to delete record {}: {}", record.id, e);

        record.success = false;
        if let Err(save_error) = self.repository.save(&record) {
            error!(
                "Record {} of {} is still marked successful: {}",
                record.id, record.object_id, save_error
            );
        }
        Err(e)
    }

    fn spool_dir(&self) -> Option<&Path> {
        self.spool_dir.as_deref()
    }

    /// Write the object's current contents to `output`, returning its size
    pub async fn download_to<W: Write + Send>(&self, object_id: &str, output: &mut W) -> Result<u64> {
        let record = self
            .repository
            .find_current(object_id)?
            .ok_or_else(|| Error::ObjectNotFound(object_id.to_string()))?;

        let k = self.codec.scheme().k();
        let total = self.codec.scheme().total();

        let mut backlog: VecDeque<RetrievalJob> = VecDeque::with_capacity(total);
        for (position, slice) in record.slices().enumerate() {
            let Some(backend_id) = &slice.backend_id else {
                debug!("Fragment {} of {} was never placed", position, object_id);
                continue;
            };
            match self.registry.find(backend_id) {
                Some(backend) => backlog.push_back((position, slice.clone(), backend)),
                None => warn!(
                    "Backend {} holding fragment {} of {} is not registered",
                    backend_id, position, object_id
                ),
            }
        }

        let mut in_flight = JoinSet::new();
        for _ in 0..k {
            self.submit_retrieval(&mut backlog, &mut in_flight);
        }

        let mut fragments: Vec<Option<std::fs::File>> = (0..total).map(|_| None).collect();
        let mut retrieved = 0;
        while retrieved < k {
            let Some(joined) = in_flight.join_next().await else {
                break;
            };

            let failure = match joined {
                Ok(retrieval) => match retrieval.result {
                    Ok(data) => {
                        self.registry
                            .record_success(&retrieval.backend_id, TransferKind::Download);
                        fragments[retrieval.position] = Some(data);
                        retrieved += 1;
                        None
                    }
                    Err(e) => {
                        warn!(
                            "Fragment {} of {} unavailable from {}: {}",
                            retrieval.position, object_id, retrieval.backend_id, e
                        );
                        self.registry.record_failure(&retrieval.backend_id, &e);
                        Some(e)
                    }
                },
                Err(e) => Some(tasks::join_error(e)),
            };

            if failure.is_some() {
                self.submit_retrieval(&mut backlog, &mut in_flight);
            }
        }
        // Surplus tasks keep running detached; their results are dropped
        in_flight.detach_all();

        if retrieved < k {
            error!(
                "Cannot reconstruct {}: {} of {} fragments retrieved",
                object_id, retrieved, k
            );
            return Err(Error::ReconstructionFailure {
                available: retrieved,
                required: k,
            });
        }

        let mut sources: Vec<Option<BufReader<std::fs::File>>> = fragments
            .into_iter()
            .map(|f| f.map(BufReader::new))
            .collect();
        self.codec
            .decode_windowed(&mut sources, record.data_size, output)?;

        debug!(
            "Downloaded {} ({} bytes) from {} fragments",
            object_id, record.data_size, retrieved
        );
        Ok(record.data_size)
    }

    /// Start the next backlog retrieval, if any is left
    fn submit_retrieval(
        &self,
        backlog: &mut VecDeque<RetrievalJob>,
        in_flight: &mut JoinSet<Retrieval>,
    ) {
        if let Some((position, slice, backend)) = backlog.pop_front() {
            tasks::spawn_retrieval(
                in_flight,
                position,
                slice,
                backend,
                self.verify_checksums,
                self.spool_dir.clone(),
                Arc::clone(&self.transfers),
            );
        }
    }

    /// The object's current contents
    pub async fn download(&self, object_id: &str) -> Result<Vec<u8>> {
        let mut output = Vec::new();
        self.download_to(object_id, &mut output).await?;
        Ok(output)
    }

    /// Remove the object's fragments and its successful records.
    ///
    /// Fragment delete failures are logged and leave orphaned blobs behind;
    /// they do not fail the operation. Leftover epochs that an earlier
    /// upload failed to retire are removed too.
    pub async fn delete(&self, object_id: &str) -> Result<()> {
        let epochs: Vec<UploadRecord> = self
            .repository
            .find_by_object(object_id)?
            .into_iter()
            .filter(|r| r.success)
            .collect();
        if epochs.is_empty() {
            return Err(Error::ObjectNotFound(object_id.to_string()));
        }

        let mut failed = 0;
        for record in &epochs {
            failed += self.delete_fragments(record).await;
        }
        let count = epochs.len();
        let mut removal = Ok(());
        for record in epochs {
            if let Err(e) = self.remove_record(record) {
                removal = removal.and(Err(e));
            }
        }
        removal?;

        info!(
            "Deleted {} ({} epochs, {} fragment deletes failed)",
            object_id, count, failed
        );
        Ok(())
    }

    /// Every record of an object, failed attempts included, oldest first
    pub fn history(&self, object_id: &str) -> Result<Vec<UploadRecord>> {
        self.repository.find_by_object(object_id)
    }

    /// Delete every placed fragment of a record in parallel; returns the
    /// number of failed deletes
    async fn delete_fragments(&self, record: &UploadRecord) -> usize {
        let mut failed = 0;
        let mut handles = Vec::new();

        for slice in record.placed_slices() {
            let Some(backend_id) = &slice.backend_id else {
                continue;
            };
            match self.registry.find(backend_id) {
                Some(backend) => handles.push(tasks::spawn_removal(
                    slice.id.clone(),
                    backend,
                    Arc::clone(&self.transfers),
                )),
                None => {
                    warn!(
                        "Cannot delete fragment {}: backend {} not registered",
                        slice.id, backend_id
                    );
                    failed += 1;
                }
            }
        }

        for joined in join_all(handles).await {
            match joined {
                Ok(removal) => match removal.result {
                    Ok(()) => self
                        .registry
                        .record_success(&removal.backend_id, TransferKind::Delete),
                    Err(e) => {
                        warn!(
                            "Failed to delete fragment {} from {}: {}",
                            removal.slice_id, removal.backend_id, e
                        );
                        self.registry.record_failure(&removal.backend_id, &e);
                        failed += 1;
                    }
                },
                Err(e) => {
                    warn!("{}", tasks::join_error(e));
                    failed += 1;
                }
            }
        }

        failed
    }

    /// Sum of the backends' total capacity; unreachable backends count as 0
    pub async fn total_capacity(&self) -> Result<u64> {
        let backends = self.registry.list();
        let results = join_all(backends.iter().map(|b| b.total_capacity())).await;
        Ok(sum_capacities(&backends, results))
    }

    /// Sum of the backends' free capacity; unreachable backends count as 0
    pub async fn available_capacity(&self) -> Result<u64> {
        let backends = self.registry.list();
        let results = join_all(backends.iter().map(|b| b.available_capacity())).await;
        Ok(sum_capacities(&backends, results))
    }
}

fn sum_capacities(backends: &[Arc<dyn Backend>], results: Vec<Result<u64>>) -> u64 {
    backends
        .iter()
        .zip(results)
        .map(|(backend, result)| match result {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Capacity of {} unknown: {}", backend.id(), e);
                0
            }
        })
        .sum()
}

#[async_trait]
impl Backend for DistributedStore {
    fn id(&self) -> &str {
        &self.id
    }

    async fn put(
        &self,
        blob_id: &str,
        source: &mut (dyn AsyncRead + Send + Unpin),
        length: u64,
    ) -> Result<u64> {
        // Stage the stream so the codec can read it synchronously
        let mut staged = tokio::fs::File::from_std(spool::spool_file(self.spool_dir())?);
        let copied = tokio::io::copy(&mut (&mut *source).take(length), &mut staged).await?;
        if copied != length {
            return Err(Error::backend(
                &self.id,
                format!("source ended after {} of {} bytes", copied, length),
            ));
        }
        staged.flush().await?;

        let mut file = staged.into_std().await;
        file.rewind()?;
        let record = self
            .upload(blob_id, &mut BufReader::new(file), length)
            .await?;
        Ok(record.data_size)
    }

    async fn get(&self, blob_id: &str, sink: &mut (dyn AsyncWrite + Send + Unpin)) -> Result<u64> {
        let mut staged = BufWriter::new(spool::spool_file(self.spool_dir())?);
        match self.download_to(blob_id, &mut staged).await {
            Err(Error::ObjectNotFound(id)) => return Err(Error::BlobNotFound(id)),
            other => other?,
        };

        let mut file = staged.into_inner().map_err(|e| Error::Io(e.into_error()))?;
        file.rewind()?;
        let copied = tokio::io::copy(&mut tokio::fs::File::from_std(file), &mut *sink).await?;
        sink.flush().await?;
        Ok(copied)
    }

    async fn delete(&self, blob_id: &str) -> Result<()> {
        match DistributedStore::delete(self, blob_id).await {
            Err(Error::ObjectNotFound(_)) => Ok(()),
            other => other,
        }
    }

    async fn total_capacity(&self) -> Result<u64> {
        DistributedStore::total_capacity(self).await
    }

    async fn available_capacity(&self) -> Result<u64> {
        DistributedStore::available_capacity(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendPool, LocalBackend, MemoryBackend};
    use crate::erasure::CodingMethod;
    use crate::metadata::SledUploadRepository;
    use bytes::Bytes;
    use rand::RngCore;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    const MIB: usize = 1024 * 1024;

    struct Harness {
        store: DistributedStore,
        backends: Vec<Arc<MemoryBackend>>,
        repository: Arc<FailingRepository>,
    }

    impl Harness {
        fn backend(&self, id: &str) -> &Arc<MemoryBackend> {
            self.backends
                .iter()
                .find(|b| b.id() == id)
                .expect("backend in harness")
        }

        fn total_blobs(&self) -> usize {
            self.backends.iter().map(|b| b.blob_count()).sum()
        }

        /// Take down the backends holding the given fragment positions
        fn take_down(&self, record: &UploadRecord, positions: &[usize]) {
            let slices: Vec<&SliceMetadata> = record.slices().collect();
            for &position in positions {
                let backend_id = slices[position].backend_id.as_deref().unwrap();
                self.backend(backend_id).set_available(false);
            }
        }
    }

    /// Repository whose writes can be made to fail
    struct FailingRepository {
        inner: SledUploadRepository,
        fail_inserts: AtomicBool,
        fail_saves: AtomicBool,
        fail_deletes: AtomicBool,
    }

    impl FailingRepository {
        fn new() -> Self {
            Self {
                inner: SledUploadRepository::temporary().unwrap(),
                fail_inserts: AtomicBool::new(false),
                fail_saves: AtomicBool::new(false),
                fail_deletes: AtomicBool::new(false),
            }
        }

        fn check(flag: &AtomicBool) -> Result<()> {
            if flag.load(Ordering::SeqCst) {
                return Err(Error::Persistence("disk full".to_string()));
            }
            Ok(())
        }

        fn successful(&self, object_id: &str) -> Vec<String> {
            self.inner
                .find_by_object(object_id)
                .unwrap()
                .into_iter()
                .filter(|r| r.success)
                .map(|r| r.id)
                .collect()
        }
    }

    impl UploadRepository for FailingRepository {
        fn insert(&self, record: &UploadRecord) -> Result<()> {
            Self::check(&self.fail_inserts)?;
            self.inner.insert(record)
        }

        fn save(&self, record: &UploadRecord) -> Result<()> {
            Self::check(&self.fail_saves)?;
            self.inner.save(record)
        }

        fn delete(&self, record_id: &str) -> Result<()> {
            Self::check(&self.fail_deletes)?;
            self.inner.delete(record_id)
        }

        fn find(&self, record_id: &str) -> Result<Option<UploadRecord>> {
            self.inner.find(record_id)
        }

        fn find_current(&self, object_id: &str) -> Result<Option<UploadRecord>> {
            self.inner.find_current(object_id)
        }

        fn find_by_object(&self, object_id: &str) -> Result<Vec<UploadRecord>> {
            self.inner.find_by_object(object_id)
        }
    }

    fn harness_with(
        method: CodingMethod,
        k: usize,
        m: usize,
        w: usize,
        backends: usize,
        window: usize,
    ) -> Harness {
        let scheme = CodingScheme::new(method, k, m, w, 64).unwrap();
        let codec = StreamingCodec::new(Arc::new(scheme), window).unwrap();

        let pool = Arc::new(BackendPool::new(k, k + m));
        let mut memory = Vec::new();
        for i in 0..backends {
            let backend = Arc::new(MemoryBackend::new(format!("mem-{}", i), 64 * MIB as u64));
            pool.register(Arc::clone(&backend) as Arc<dyn Backend>).unwrap();
            memory.push(backend);
        }

        let repository = Arc::new(FailingRepository::new());
        let store = DistributedStore::new(
            "test-store",
            codec,
            pool,
            Arc::clone(&repository) as Arc<dyn UploadRepository>,
        );

        Harness {
            store,
            backends: memory,
            repository,
        }
    }

    fn harness(k: usize, m: usize, backends: usize) -> Harness {
        harness_with(CodingMethod::Cauchy, k, m, 8, backends, crate::erasure::DEFAULT_WINDOW_SIZE)
    }

    fn random_bytes(len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut data);
        data
    }

    #[tokio::test]
    async fn test_roundtrip_all_backends_up() {
        let h = harness(6, 2, 8);
        let data = random_bytes(100_000);

        let record = h.store.upload_bytes("obj", &data).await.unwrap();
        assert!(record.success);
        assert_eq!(record.placed_count(), 8);
        assert_eq!(h.total_blobs(), 8);

        // One fragment per backend
        let mut used: Vec<_> = record.slices().filter_map(|s| s.backend_id.clone()).collect();
        used.sort();
        used.dedup();
        assert_eq!(used.len(), 8);

        assert_eq!(h.store.download("obj").await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_download_with_two_backends_unavailable() {
        let h = harness(6, 2, 8);
        let data = random_bytes(MIB);
        let record = h.store.upload_bytes("obj", &data).await.unwrap();

        // Lose two data fragments so reconstruction is required
        h.take_down(&record, &[0, 3]);

        let downloaded = h.store.download("obj").await.unwrap();
        assert_eq!(downloaded.len(), MIB);
        assert_eq!(downloaded, data);
    }

    #[tokio::test]
    async fn test_download_with_three_backends_unavailable() {
        let h = harness(6, 2, 8);
        let data = random_bytes(MIB);
        let record = h.store.upload_bytes("obj", &data).await.unwrap();

        h.take_down(&record, &[1, 4, 7]);

        match h.store.download("obj").await {
            Err(Error::ReconstructionFailure {
                available,
                required,
            }) => {
                assert_eq!(available, 5);
                assert_eq!(required, 6);
            }
            other => panic!("expected ReconstructionFailure, got {:?}", other.map(|d| d.len())),
        }
    }

    #[tokio::test]
    async fn test_partial_placement_is_rolled_back() {
        let h = harness(6, 2, 8);
        for backend in &h.backends[5..] {
            backend.set_available(false);
        }

        let err = h
            .store
            .upload_bytes("obj", &random_bytes(MIB))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::UploadIncomplete {
                placed: 5,
                required: 8
            }
        ));

        assert!(h.repository.find_current("obj").unwrap().is_none());
        assert_eq!(h.total_blobs(), 0);

        // The failed attempt is kept for audit
        let history = h.store.history("obj").unwrap();
        assert_eq!(history.len(), 1);
        assert!(!history[0].success);
    }

    #[tokio::test]
    async fn test_too_few_backends_in_pool() {
        let h = harness(6, 2, 5);
        let err = h
            .store
            .upload_bytes("obj", &random_bytes(10_000))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UploadIncomplete { placed: 5, .. }));
        assert_eq!(h.total_blobs(), 0);
        assert!(matches!(
            h.store.download("obj").await,
            Err(Error::ObjectNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reupload_supersedes_previous_epoch() {
        let h = harness(4, 2, 6);
        let first = random_bytes(20_000);
        let second = random_bytes(30_000);

        let old = h.store.upload_bytes("obj", &first).await.unwrap();
        let new = h.store.upload_bytes("obj", &second).await.unwrap();
        assert!(new.timestamp > old.timestamp);

        assert_eq!(h.store.download("obj").await.unwrap(), second);
        assert_eq!(h.total_blobs(), 6);
        assert!(h.repository.find(&old.id).unwrap().is_none());
        for slice in old.slices() {
            let holder = slice.backend_id.as_deref().unwrap();
            assert!(!h.backend(holder).contains(&slice.id));
        }
    }

    #[tokio::test]
    async fn test_failed_commit_keeps_prior_epoch() {
        let h = harness(4, 2, 6);
        let first = random_bytes(20_000);
        h.store.upload_bytes("obj", &first).await.unwrap();

        h.repository.fail_inserts.store(true, Ordering::SeqCst);
        let err = h
            .store
            .upload_bytes("obj", &random_bytes(20_000))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Persistence(_)));

        // New fragments were rolled back; the old epoch is intact
        assert_eq!(h.total_blobs(), 6);
        h.repository.fail_inserts.store(false, Ordering::SeqCst);
        assert_eq!(h.store.download("obj").await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_relaxed_required_placements() {
        let mut h = harness(4, 2, 5);
        h.store = h.store.with_required_placements(5).unwrap();
        let data = random_bytes(50_000);

        let record = h.store.upload_bytes("obj", &data).await.unwrap();
        assert_eq!(record.placed_count(), 5);

        // One fragment was never placed; one more may be lost
        let placed_position = record
            .slices()
            .position(|s| s.is_placed())
            .unwrap();
        h.take_down(&record, &[placed_position]);
        assert_eq!(h.store.download("obj").await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_required_placements_bounds() {
        let h = harness(4, 2, 6);
        assert_eq!(h.store.required_placements(), 6);
        let h2 = harness(4, 2, 6);
        assert!(h.store.with_required_placements(3).is_err());
        assert!(h2.store.with_required_placements(7).is_err());
    }

    #[tokio::test]
    async fn test_delete_tolerates_fragment_failures() {
        let h = harness(4, 2, 6);
        let record = h.store.upload_bytes("obj", &random_bytes(5_000)).await.unwrap();
        h.take_down(&record, &[2]);

        h.store.delete("obj").await.unwrap();
        assert!(h.repository.find_current("obj").unwrap().is_none());
        // Only the unreachable backend still holds its fragment
        assert_eq!(h.total_blobs(), 1);

        assert!(matches!(
            h.store.delete("obj").await,
            Err(Error::ObjectNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_corrupted_fragment_triggers_backfill() {
        let h = harness(4, 2, 6);
        let data = random_bytes(40_000);
        let record = h.store.upload_bytes("obj", &data).await.unwrap();

        let slice = &record.data_slices[0];
        let holder = h.backend(slice.backend_id.as_deref().unwrap());
        holder.overwrite(&slice.id, Bytes::from(vec![0xAA; slice.size as usize]));

        assert_eq!(h.store.download("obj").await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_zero_length_object() {
        let h = harness(3, 2, 5);
        let record = h.store.upload_bytes("empty", &[]).await.unwrap();
        assert_eq!(record.fragment_size, 0);
        assert!(h.store.download("empty").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_windowed_upload_with_reed_solomon() {
        let h = harness_with(CodingMethod::ReedSolomon, 3, 2, 8, 5, 4096);
        let data = random_bytes(50_001);
        let record = h.store.upload_bytes("obj", &data).await.unwrap();
        assert_eq!(
            record.fragment_size,
            h.store.codec().encoded_fragment_len(50_001)
        );

        h.take_down(&record, &[0, 2]);
        assert_eq!(h.store.download("obj").await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_liberation_store() {
        let h = harness_with(CodingMethod::Liberation, 5, 2, 7, 7, 64 * 1024);
        let data = random_bytes(200_000);
        let record = h.store.upload_bytes("obj", &data).await.unwrap();
        h.take_down(&record, &[1, 6]);
        assert_eq!(h.store.download("obj").await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_placements_rotate_over_pool() {
        let h = harness(2, 1, 4);
        h.store.upload_bytes("a", b"first object").await.unwrap();
        let second = h.store.upload_bytes("b", b"second object").await.unwrap();

        // mem-3 was skipped by the first upload, so it is first in line now
        assert!(second
            .slices()
            .any(|s| s.backend_id.as_deref() == Some("mem-3")));
    }

    #[tokio::test]
    async fn test_capacity_aggregation() {
        let h = harness(2, 1, 3);
        let total = h.store.total_capacity().await.unwrap();
        assert_eq!(total, 3 * 64 * MIB as u64);

        h.store.upload_bytes("obj", &random_bytes(4096)).await.unwrap();
        let available = h.store.available_capacity().await.unwrap();
        assert!(available < total);

        // Unreachable backends contribute nothing
        h.backends[0].set_available(false);
        assert_eq!(h.store.total_capacity().await.unwrap(), 2 * 64 * MIB as u64);
    }

    #[tokio::test]
    async fn test_store_as_backend() {
        let h = harness(2, 1, 3);
        let backend: &dyn Backend = &h.store;
        assert_eq!(backend.id(), "test-store");

        let written = backend.put_bytes("blob", b"nested").await.unwrap();
        assert_eq!(written, 6);
        assert_eq!(backend.get_bytes("blob").await.unwrap(), b"nested");

        backend.delete("blob").await.unwrap();
        assert!(matches!(
            backend.get_bytes("blob").await,
            Err(Error::BlobNotFound(_))
        ));
        // Deleting an absent blob is not an error
        backend.delete("blob").await.unwrap();
    }

    #[tokio::test]
    async fn test_store_as_backend_streams() {
        let h = harness(3, 2, 5);
        let backend: &dyn Backend = &h.store;
        let data = random_bytes(70_000);

        // Only `length` bytes of the source belong to the blob
        let mut source: &[u8] = &data;
        assert_eq!(backend.put("blob", &mut source, 50_000).await.unwrap(), 50_000);
        assert_eq!(source.len(), 20_000);

        let mut sink = Vec::new();
        assert_eq!(backend.get("blob", &mut sink).await.unwrap(), 50_000);
        assert_eq!(sink, &data[..50_000]);

        let mut short: &[u8] = &data[..10];
        assert!(backend.put("short", &mut short, 20).await.is_err());
        assert!(h.repository.find_current("short").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_local_backends_with_spool_dir() {
        let disks = TempDir::new().unwrap();
        let spool = TempDir::new().unwrap();

        let scheme = CodingScheme::new(CodingMethod::Cauchy, 4, 2, 8, 64).unwrap();
        let codec = StreamingCodec::new(Arc::new(scheme), 16 * 1024).unwrap();
        let pool = Arc::new(BackendPool::new(4, 6));
        for i in 0..6 {
            let backend = LocalBackend::open(format!("disk-{}", i), disks.path().join(i.to_string()), 8 * MIB as u64)
                .await
                .unwrap();
            pool.register(Arc::new(backend)).unwrap();
        }
        let repository = Arc::new(SledUploadRepository::temporary().unwrap());
        let store = DistributedStore::new("local", codec, pool, repository)
            .with_spool_dir(Some(spool.path().to_path_buf()));

        // Many windows, each spooled rather than held whole
        let data = random_bytes(300_000);
        let record = store.upload_bytes("obj", &data).await.unwrap();
        assert_eq!(record.fragment_size, store.codec().encoded_fragment_len(300_000));

        assert_eq!(store.download("obj").await.unwrap(), data);
        assert_eq!(std::fs::read_dir(spool.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_failed_audit_record_is_reported() {
        let h = harness(6, 2, 5);
        h.repository.fail_inserts.store(true, Ordering::SeqCst);

        let err = h
            .store
            .upload_bytes("obj", &random_bytes(10_000))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Persistence(_)));
        // Compensating deletes still ran
        assert_eq!(h.total_blobs(), 0);
    }

    #[tokio::test]
    async fn test_record_removal_failure_after_commit() {
        let h = harness(4, 2, 6);
        let old = h.store.upload_bytes("obj", &random_bytes(20_000)).await.unwrap();

        h.repository.fail_deletes.store(true, Ordering::SeqCst);
        let second = random_bytes(20_000);
        let new = h.store.upload_bytes("obj", &second).await.unwrap();

        // The new epoch is committed and the old fragments are gone
        assert_eq!(h.store.download("obj").await.unwrap(), second);
        assert_eq!(h.total_blobs(), 6);
        // The old record could not be removed, so it was demoted instead
        assert!(!h.repository.find(&old.id).unwrap().unwrap().success);
        assert_eq!(h.repository.successful("obj"), vec![new.id]);

        h.repository.fail_deletes.store(false, Ordering::SeqCst);
        h.store.delete("obj").await.unwrap();
        assert!(matches!(
            h.store.download("obj").await,
            Err(Error::ObjectNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_removes_leftover_epochs() {
        let h = harness(4, 2, 6);
        h.store.upload_bytes("obj", &random_bytes(20_000)).await.unwrap();

        // Neither removing nor demoting the old record works
        h.repository.fail_deletes.store(true, Ordering::SeqCst);
        h.repository.fail_saves.store(true, Ordering::SeqCst);
        h.store.upload_bytes("obj", &random_bytes(20_000)).await.unwrap();
        assert_eq!(h.repository.successful("obj").len(), 2);

        h.repository.fail_deletes.store(false, Ordering::SeqCst);
        h.repository.fail_saves.store(false, Ordering::SeqCst);
        h.store.delete("obj").await.unwrap();

        assert!(h.repository.successful("obj").is_empty());
        assert!(matches!(
            h.store.download("obj").await,
            Err(Error::ObjectNotFound(_))
        ));
        assert_eq!(h.total_blobs(), 0);
    }

    #[tokio::test]
    async fn test_next_upload_retires_leftover_epochs() {
        let h = harness(4, 2, 6);
        h.store.upload_bytes("obj", &random_bytes(20_000)).await.unwrap();

        h.repository.fail_deletes.store(true, Ordering::SeqCst);
        h.repository.fail_saves.store(true, Ordering::SeqCst);
        h.store.upload_bytes("obj", &random_bytes(20_000)).await.unwrap();

        h.repository.fail_deletes.store(false, Ordering::SeqCst);
        h.repository.fail_saves.store(false, Ordering::SeqCst);
        let third = random_bytes(20_000);
        let latest = h.store.upload_bytes("obj", &third).await.unwrap();

        assert_eq!(h.repository.successful("obj"), vec![latest.id]);
        assert_eq!(h.store.download("obj").await.unwrap(), third);
        assert_eq!(h.total_blobs(), 6);
    }

    #[tokio::test]
    async fn test_from_config() {
        let mut config = Config::default();
        config.erasure.data_fragments = 2;
        config.erasure.coding_fragments = 1;
        config.store.required_placements = Some(2);

        let pool = Arc::new(BackendPool::new(2, 3));
        for i in 0..3 {
            pool.register(Arc::new(MemoryBackend::new(format!("b{}", i), MIB as u64)))
                .unwrap();
        }
        let repository = Arc::new(SledUploadRepository::temporary().unwrap());

        let store = DistributedStore::from_config(&config, pool, repository).unwrap();
        assert_eq!(store.required_placements(), 2);
        assert_eq!(store.codec().scheme().k(), 2);

        store.upload_bytes("obj", b"configured").await.unwrap();
        assert_eq!(store.download("obj").await.unwrap(), b"configured");
    }
}
