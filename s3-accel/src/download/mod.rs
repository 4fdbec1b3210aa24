//! The download coordinator.
//!
//! One probe request learns the object's size and part layout; its body is
//! kept so the first part never downloads twice. Delivery then fans out to
//! at most `concurrency` workers pulling part numbers from a shared
//! counter, while a single writer task replays completed parts to the sink
//! in strict ascending order, buffering any part whose predecessor has not
//! been written yet. Downloads stay decoupled from writes: a worker is
//! released for its next part as soon as the writer accepts the bytes, not
//! when the sink drains them.

mod sink;

use crate::config::DownloadOptions;
use crate::credentials::{DefaultChainProvider, ProvideCredentials};
use crate::error::Error;
use crate::events::{DownloadEvent, Emitter, EventKind, ListenerId};
use crate::http::{ConnectionPool, Endpoint, TimeoutProfile};
use crate::imds::ImdsClient;
use crate::region;
use crate::retry::RetryPolicy;
use crate::s3::{ObjectClient, ObjectRef, PartSpec};
use bytes::Bytes;
use sink::SinkDest;
use std::collections::BTreeMap;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::{OnceCell, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Buffered chunks between the writer and a stream consumer.
const STREAM_CHANNEL_CAPACITY: usize = 4;

/// Probe result: size, layout, and the memoized first-part body.
#[derive(Clone)]
struct ProbeResult {
    body: Bytes,
    object_size: u64,
    parts_total: u64,
}

/// What `meta` reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectMeta {
    pub length_in_bytes: u64,
    /// Planned part count: the object's own multipart layout in
    /// part-number mode, the range math otherwise.
    pub parts: Option<u64>,
}

struct Shared {
    object: ObjectRef,
    options: DownloadOptions,
    part_size: Option<u64>,
    endpoint_override: Option<Endpoint>,
    timeouts: TimeoutProfile,
    retry: RetryPolicy,
    pool: Arc<ConnectionPool>,
    provider: Arc<dyn ProvideCredentials>,
    emitter: Emitter,
    cancel: CancellationToken,
    aborted: AtomicBool,
    abort_reason: Mutex<Option<Error>>,
    started: AtomicBool,
    client: OnceCell<Arc<ObjectClient>>,
    probe: OnceCell<Result<ProbeResult, Error>>,
    parts_downloading: AtomicUsize,
    next_part: AtomicU64,
}

impl Shared {
    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// First abort wins; later causes are dropped. Muting precedes the
    /// cancel broadcast so no event can slip out after the transition.
    fn abort_with(&self, error: Error) {
        if self.aborted.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(%error, "download aborted");
        *self.abort_reason.lock().expect("abort reason poisoned") = Some(error);
        self.emitter.mute();
        self.cancel.cancel();
    }

    fn abort_reason(&self) -> Error {
        self.abort_reason
            .lock()
            .expect("abort reason poisoned")
            .clone()
            .unwrap_or_else(Error::cancelled)
    }

    fn emit(&self, event: &DownloadEvent) {
        self.emitter.emit(event);
    }

    /// Resolve region and endpoint once, then keep the per-object client.
    async fn client(&self) -> Result<Arc<ObjectClient>, Error> {
        self.client
            .get_or_try_init(|| async {
                let region = match &self.options.region {
                    Some(region) => region.clone(),
                    None => region::region(ImdsClient::shared(), &self.cancel).await?,
                };
                let endpoint = match &self.endpoint_override {
                    Some(endpoint) => endpoint.clone(),
                    None => Endpoint::https(region::default_hostname(&region)),
                };
                Ok(Arc::new(ObjectClient {
                    endpoint,
                    region,
                    object: self.object.clone(),
                    provider: self.provider.clone(),
                    pool: self.pool.clone(),
                    timeouts: self.timeouts,
                    retry: self.retry,
                }))
            })
            .await
            .cloned()
    }

    fn part_spec(&self, part_no: u64, object_size: u64) -> PartSpec {
        match self.part_size {
            Some(part_size) => {
                let start = (part_no - 1) * part_size;
                let end = (part_no * part_size - 1).min(object_size.saturating_sub(1));
                PartSpec::Range { start, end }
            }
            None => PartSpec::PartNumber(part_no),
        }
    }

    /// Memoized probe: concurrent callers share one in-flight request, and
    /// both the outcome and the first-part body are kept.
    async fn probe(&self) -> Result<ProbeResult, Error> {
        self.probe.get_or_init(|| self.probe_once()).await.clone()
    }

    async fn probe_once(&self) -> Result<ProbeResult, Error> {
        let client = self.client().await?;
        let spec = match self.part_size {
            Some(part_size) => PartSpec::Range { start: 0, end: part_size - 1 },
            None => PartSpec::PartNumber(1),
        };
        self.parts_downloading.fetch_add(1, Ordering::SeqCst);
        let response = client.get(spec, &self.cancel).await;
        self.parts_downloading.fetch_sub(1, Ordering::SeqCst);
        let response = response?;

        if response.zero_length {
            return Ok(ProbeResult { body: Bytes::new(), object_size: 0, parts_total: 1 });
        }
        let content_range = response.content_range.ok_or_else(|| Error::UnexpectedResponse {
            status_code: 206,
            content_type: None,
            body: Bytes::new(),
        })?;
        let object_size = content_range.total;
        let parts_total = match self.part_size {
            Some(part_size) => object_size.div_ceil(part_size).max(1),
            None => response.parts_count.unwrap_or(1).max(1),
        };
        debug!(object_size, parts_total, "object probed");
        Ok(ProbeResult { body: response.body, object_size, parts_total })
    }
}

/// Handle to one in-progress or pending download. Cheap to clone; all
/// clones observe the same state.
#[derive(Clone)]
pub struct Download {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Download {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Download").finish_non_exhaustive()
    }
}

/// Create a download. Inputs are validated here; no I/O happens until
/// [`Download::meta`], [`Download::read_stream`] or [`Download::to_file`].
pub fn download(object: ObjectRef, options: DownloadOptions) -> Result<Download, Error> {
    options.validate()?;
    let endpoint_override = match &options.endpoint {
        Some(value) => Some(Endpoint::parse(value)?),
        None => None,
    };
    let provider: Arc<dyn ProvideCredentials> = match &options.credentials_provider {
        Some(provider) => provider.clone(),
        None => Arc::new(DefaultChainProvider),
    };
    let pool = options.connection_pool.clone().unwrap_or_default();
    let shared = Shared {
        part_size: options.part_size_bytes(),
        endpoint_override,
        timeouts: options.timeout_profile(),
        retry: options.retry_policy(),
        pool,
        provider,
        emitter: Emitter::new(),
        cancel: CancellationToken::new(),
        aborted: AtomicBool::new(false),
        abort_reason: Mutex::new(None),
        started: AtomicBool::new(false),
        client: OnceCell::new(),
        probe: OnceCell::new(),
        parts_downloading: AtomicUsize::new(0),
        next_part: AtomicU64::new(0),
        object,
        options,
    };
    Ok(Download { shared: Arc::new(shared) })
}

impl Download {
    /// Probe the object and report its size and part layout without
    /// starting delivery. Idempotent: repeated calls share one underlying
    /// GET and its memoized result.
    pub async fn meta(&self) -> Result<ObjectMeta, Error> {
        let probe = self.shared.probe().await?;
        Ok(ObjectMeta { length_in_bytes: probe.object_size, parts: Some(probe.parts_total) })
    }

    /// Begin delivery as a byte stream the caller drives. Single-shot: a
    /// download is consumed once, by either this or [`Download::to_file`].
    pub fn read_stream(&self) -> Result<DownloadStream, Error> {
        self.begin()?;
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        tokio::spawn(run_engine(self.shared.clone(), SinkDest::stream(tx)));
        Ok(DownloadStream { rx })
    }

    /// Download into a file the coordinator creates, truncates, and closes
    /// itself. On failure the partial file is removed and the error
    /// returned here.
    pub async fn to_file(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        self.begin()?;
        let sink = SinkDest::open_file(path.as_ref().to_path_buf()).await?;
        let engine: JoinHandle<Result<(), Error>> =
            tokio::spawn(run_engine(self.shared.clone(), sink));
        engine
            .await
            .map_err(|e| Error::Io { detail: format!("download engine failed: {e}") })?
    }

    fn begin(&self) -> Result<(), Error> {
        if self.shared.is_aborted() {
            return Err(self.shared.abort_reason());
        }
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return Err(Error::Config("download already consumed".to_string()));
        }
        Ok(())
    }

    /// Request cancellation: in-flight GETs (and their resolves, connects
    /// and backoff waits) are interrupted, buffered parts are discarded,
    /// and `reason` (or the default) reaches the sink exactly once.
    /// Idempotent; the first call wins.
    pub fn abort(&self, reason: Option<Error>) {
        self.shared.abort_with(reason.unwrap_or_else(Error::cancelled));
    }

    /// Parts whose GET is in flight right now. Never exceeds the
    /// configured concurrency.
    pub fn parts_downloading(&self) -> usize {
        self.shared.parts_downloading.load(Ordering::SeqCst)
    }

    /// Planned part count, once the probe has resolved.
    pub fn parts_total(&self) -> Option<u64> {
        match self.shared.probe.get() {
            Some(Ok(probe)) => Some(probe.parts_total),
            _ => None,
        }
    }

    pub fn on(
        &self,
        kind: EventKind,
        listener: impl Fn(&DownloadEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        self.shared.emitter.on(kind, listener)
    }

    pub fn once(
        &self,
        kind: EventKind,
        listener: impl Fn(&DownloadEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        self.shared.emitter.once(kind, listener)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.shared.emitter.off(id)
    }
}

/// Ordered bytes of one object. Ends after the final chunk; a failed
/// download yields the terminal error as the last item.
#[derive(Debug)]
pub struct DownloadStream {
    rx: mpsc::Receiver<Result<Bytes, Error>>,
}

impl futures::Stream for DownloadStream {
    type Item = Result<Bytes, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

async fn run_engine(shared: Arc<Shared>, sink: SinkDest) -> Result<(), Error> {
    let probe = match shared.probe().await {
        Ok(probe) => probe,
        Err(error) => {
            shared.abort_with(error);
            let reason = shared.abort_reason();
            sink.fail(reason.clone()).await;
            return Err(reason);
        }
    };
    if shared.is_aborted() {
        let reason = shared.abort_reason();
        sink.fail(reason.clone()).await;
        return Err(reason);
    }

    shared.emit(&DownloadEvent::ObjectDownloading {
        object_size: probe.object_size,
        parts_count: Some(probe.parts_total),
    });
    shared.emit(&DownloadEvent::PartDownloading { part_no: 1 });
    shared.emit(&DownloadEvent::PartDownloaded { part_no: 1 });

    let parts_total = probe.parts_total;
    let (parts_tx, parts_rx) = mpsc::channel::<(u64, Bytes)>(shared.options.concurrency);
    let writer: JoinHandle<Result<(), Error>> =
        tokio::spawn(write_loop(shared.clone(), parts_rx, sink, parts_total));

    // The probe body is part 1. A send failure means the writer already
    // bailed, which only happens on abort; the join below surfaces it.
    let _ = parts_tx.send((1, probe.body.clone())).await;

    if parts_total > 1 {
        shared.next_part.store(2, Ordering::SeqCst);
        let worker_count = (parts_total - 1).min(shared.options.concurrency as u64);
        let client = match shared.client().await {
            Ok(client) => client,
            Err(error) => {
                shared.abort_with(error);
                drop(parts_tx);
                let _ = writer.await;
                return Err(shared.abort_reason());
            }
        };
        let workers: Vec<JoinHandle<()>> = (0..worker_count)
            .map(|_| {
                tokio::spawn(worker_loop(
                    shared.clone(),
                    client.clone(),
                    parts_tx.clone(),
                    probe.object_size,
                    parts_total,
                ))
            })
            .collect();
        drop(parts_tx);
        for worker in workers {
            if let Err(join_error) = worker.await {
                shared.abort_with(Error::Io { detail: format!("worker failed: {join_error}") });
            }
        }
    } else {
        drop(parts_tx);
    }

    match writer.await {
        Ok(result) => result,
        Err(join_error) => {
            let error = Error::Io { detail: format!("writer failed: {join_error}") };
            shared.abort_with(error.clone());
            Err(shared.abort_reason())
        }
    }
}

/// Pull part numbers off the shared counter until they run out.
async fn worker_loop(
    shared: Arc<Shared>,
    client: Arc<ObjectClient>,
    parts_tx: mpsc::Sender<(u64, Bytes)>,
    object_size: u64,
    parts_total: u64,
) {
    loop {
        if shared.is_aborted() {
            return;
        }
        let part_no = shared.next_part.fetch_add(1, Ordering::SeqCst);
        if part_no > parts_total {
            return;
        }

        shared.emit(&DownloadEvent::PartDownloading { part_no });
        shared.parts_downloading.fetch_add(1, Ordering::SeqCst);
        let result = client.get(shared.part_spec(part_no, object_size), &shared.cancel).await;
        shared.parts_downloading.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok(response) => {
                shared.emit(&DownloadEvent::PartDownloaded { part_no });
                // Completion of this send is the "write enqueued" signal
                // that frees the worker for its next part.
                if parts_tx.send((part_no, response.body)).await.is_err() {
                    return;
                }
            }
            Err(error) => {
                if !shared.is_aborted() {
                    warn!(part_no, %error, "part download failed");
                    shared.abort_with(error);
                }
                return;
            }
        }
    }
}

/// Replay completed parts to the sink in strict ascending order.
async fn write_loop(
    shared: Arc<Shared>,
    mut parts_rx: mpsc::Receiver<(u64, Bytes)>,
    mut sink: SinkDest,
    parts_total: u64,
) -> Result<(), Error> {
    let mut waiting: BTreeMap<u64, Bytes> = BTreeMap::new();
    let mut last_written: u64 = 0;

    while last_written < parts_total {
        let message = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => None,
            message = parts_rx.recv() => message,
        };
        let Some((part_no, bytes)) = message else {
            break;
        };
        waiting.insert(part_no, bytes);

        loop {
            if shared.is_aborted() {
                break;
            }
            let Some(bytes) = waiting.remove(&(last_written + 1)) else {
                break;
            };
            let part_no = last_written + 1;
            shared.emit(&DownloadEvent::PartWriting { part_no });
            if let Err(error) = sink.write(bytes).await {
                shared.abort_with(error);
                let reason = shared.abort_reason();
                sink.fail(reason.clone()).await;
                return Err(reason);
            }
            last_written = part_no;
            shared.emit(&DownloadEvent::PartDone { part_no });
            // Fresh scheduling tick between ordered writes so a long
            // buffered run cannot starve other tasks.
            tokio::task::yield_now().await;
        }
    }

    if shared.is_aborted() || last_written < parts_total {
        if !shared.is_aborted() {
            shared.abort_with(Error::cancelled());
        }
        let reason = shared.abort_reason();
        sink.fail(reason.clone()).await;
        return Err(reason);
    }

    match sink.close().await {
        Ok(()) => Ok(()),
        Err(error) => {
            shared.abort_with(error.clone());
            Err(error)
        }
    }
}
