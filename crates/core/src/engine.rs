//! Caller-owned upscale engine.
//!
//! The engine owns one worker thread. The loaded session, the padded input
//! and the blend canvas live on that thread only; callers talk to it through
//! a request queue and get results back on per-request channels. Requests
//! are served strictly in order, so at most one upscale is in flight.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::RasterImage;
use crate::error::{UpscaleError, UpscaleResult};
use crate::model_cache::ModelLoader;
use crate::params::{GuardLimits, UpscaleConfig};
use crate::pipeline::{upscale_raster, UpscaleObserver, UpscaleProgress};
use crate::session::{ExecutionBackend, SessionFactory, TileInference};

pub const DEFAULT_MODEL_LOAD_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_EVENT_BUFFER: usize = 64;

const REQUEST_QUEUE_DEPTH: usize = 16;

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub model_load_timeout: Duration,
    pub limits: GuardLimits,
    /// Progress events buffered per job. The channel holds one more slot,
    /// kept free for the terminal event.
    pub event_buffer: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            model_load_timeout: DEFAULT_MODEL_LOAD_TIMEOUT,
            limits: GuardLimits::default(),
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    ModelLoading,
    Ready,
    Upscaling,
    Complete,
    Failed,
    Disposed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::ModelLoading => "model_loading",
            Self::Ready => "ready",
            Self::Upscaling => "upscaling",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Disposed => "disposed",
        };
        f.write_str(name)
    }
}

/// Events of one upscale job: any number of `Progress`, then exactly one
/// `Complete` or `Failed`.
#[derive(Debug, Clone, PartialEq)]
pub enum UpscaleEvent {
    Progress(UpscaleProgress),
    Complete(RasterImage),
    Failed(UpscaleError),
}

impl UpscaleEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress(_))
    }
}

enum EngineRequest {
    LoadModel {
        locator: String,
        reply: oneshot::Sender<UpscaleResult<ExecutionBackend>>,
    },
    Upscale {
        image: RasterImage,
        config: UpscaleConfig,
        cancel: CancellationToken,
        events: mpsc::Sender<UpscaleEvent>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

pub struct UpscaleEngine {
    requests: mpsc::Sender<EngineRequest>,
    state: watch::Receiver<EngineState>,
    worker: Option<JoinHandle<()>>,
    options: EngineOptions,
}

impl UpscaleEngine {
    /// Starts the worker thread. No model is loaded yet.
    pub fn spawn(
        factory: Arc<dyn SessionFactory>,
        loader: ModelLoader,
        options: EngineOptions,
    ) -> Result<Self> {
        let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        let (state_tx, state_rx) = watch::channel(EngineState::Idle);

        let worker = Worker {
            factory,
            loader,
            limits: options.limits,
            session: None,
            state: state_tx,
        };
        let handle = std::thread::Builder::new()
            .name("tessera-upscale".to_string())
            .spawn(move || worker.run(request_rx))
            .context("failed to spawn upscale worker thread")?;

        Ok(Self {
            requests: request_tx,
            state: state_rx,
            worker: Some(handle),
            options,
        })
    }

    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<EngineState> {
        self.state.clone()
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Loads (or replaces) the model and returns the backend it runs on.
    ///
    /// On timeout the worker keeps going; a late success still leaves the
    /// engine `Ready`.
    pub async fn load_model(&self, locator: &str) -> UpscaleResult<ExecutionBackend> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests
            .send(EngineRequest::LoadModel {
                locator: locator.to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| UpscaleError::EngineClosed)?;

        let timeout = self.options.model_load_timeout;
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(UpscaleError::EngineClosed),
            Err(_) => {
                warn!(timeout_secs = timeout.as_secs_f64(), "Model load timed out");
                Err(UpscaleError::ModelLoadFailed(format!(
                    "timed out after {:.1}s",
                    timeout.as_secs_f64()
                )))
            }
        }
    }

    /// Queues an upscale and returns a handle to its event stream.
    pub async fn upscale(
        &self,
        image: RasterImage,
        config: UpscaleConfig,
    ) -> UpscaleResult<UpscaleJob> {
        let (event_tx, event_rx) = mpsc::channel(self.options.event_buffer.max(1) + 1);
        let cancel = CancellationToken::new();
        self.requests
            .send(EngineRequest::Upscale {
                image,
                config,
                cancel: cancel.clone(),
                events: event_tx,
            })
            .await
            .map_err(|_| UpscaleError::EngineClosed)?;

        Ok(UpscaleJob {
            events: event_rx,
            cancel,
        })
    }

    /// Releases the session and joins the worker after queued requests drain.
    pub async fn shutdown(mut self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .requests
            .send(EngineRequest::Shutdown { reply: reply_tx })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }

        if let Some(handle) = self.worker.take() {
            tokio::task::spawn_blocking(move || handle.join())
                .await
                .context("failed to join upscale worker")?
                .map_err(|_| anyhow::anyhow!("upscale worker panicked"))?;
        }
        Ok(())
    }
}

/// Handle to one queued upscale.
///
/// Dropping it stops tile dispatch the same way [`cancel`](Self::cancel) does.
/// Progress that does not fit the job's buffer is dropped; the terminal event
/// is always delivered.
pub struct UpscaleJob {
    events: mpsc::Receiver<UpscaleEvent>,
    cancel: CancellationToken,
}

impl UpscaleJob {
    /// Requests cancellation; the tile in flight still completes.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Next event, or `None` once the terminal event has been received.
    pub async fn next_event(&mut self) -> Option<UpscaleEvent> {
        self.events.recv().await
    }

    /// Drains the job, forwarding progress, and returns its outcome.
    pub async fn wait<F>(mut self, mut on_progress: F) -> UpscaleResult<RasterImage>
    where
        F: FnMut(UpscaleProgress),
    {
        while let Some(event) = self.events.recv().await {
            match event {
                UpscaleEvent::Progress(progress) => on_progress(progress),
                UpscaleEvent::Complete(image) => return Ok(image),
                UpscaleEvent::Failed(error) => return Err(error),
            }
        }
        Err(UpscaleError::EngineClosed)
    }
}

struct ChannelObserver<'a> {
    cancel: &'a CancellationToken,
    events: &'a mpsc::Sender<UpscaleEvent>,
}

impl UpscaleObserver for ChannelObserver<'_> {
    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.events.is_closed()
    }

    fn on_progress(&mut self, progress: UpscaleProgress) {
        // the last free slot belongs to the terminal event
        if self.events.capacity() > 1 {
            let _ = self.events.try_send(UpscaleEvent::Progress(progress));
        }
    }
}

fn send_terminal(events: &mpsc::Sender<UpscaleEvent>, event: UpscaleEvent) {
    match events.try_send(event) {
        Ok(()) => {}
        Err(TrySendError::Closed(_)) => debug!("Upscale result dropped: job handle went away"),
        Err(TrySendError::Full(_)) => warn!("Upscale result dropped: job event buffer is full"),
    }
}

fn panic_payload_to_string(payload: &(dyn Any + Send)) -> String {
    if let Some(payload) = payload.downcast_ref::<&str>() {
        (*payload).to_string()
    } else if let Some(payload) = payload.downcast_ref::<String>() {
        payload.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

struct Worker {
    factory: Arc<dyn SessionFactory>,
    loader: ModelLoader,
    limits: GuardLimits,
    session: Option<Box<dyn TileInference>>,
    state: watch::Sender<EngineState>,
}

impl Worker {
    fn run(mut self, mut requests: mpsc::Receiver<EngineRequest>) {
        debug!("Upscale worker started");
        while let Some(request) = requests.blocking_recv() {
            match request {
                EngineRequest::LoadModel { locator, reply } => {
                    let result = panic::catch_unwind(AssertUnwindSafe(|| self.load_model(&locator)))
                        .unwrap_or_else(|payload| {
                            let message = panic_payload_to_string(payload.as_ref());
                            warn!(%message, "Model load panicked");
                            self.session = None;
                            self.set_state(EngineState::Idle);
                            Err(UpscaleError::ModelLoadFailed(format!("panicked: {message}")))
                        });
                    if reply.send(result).is_err() {
                        debug!("Model load caller went away before the reply");
                    }
                }
                EngineRequest::Upscale {
                    image,
                    config,
                    cancel,
                    events,
                } => self.upscale(image, config, &cancel, &events),
                EngineRequest::Shutdown { reply } => {
                    self.dispose();
                    let _ = reply.send(());
                    debug!("Upscale worker shut down");
                    return;
                }
            }
        }
        self.dispose();
        debug!("Upscale worker exiting: engine dropped");
    }

    fn set_state(&self, state: EngineState) {
        self.state.send_replace(state);
    }

    fn dispose(&mut self) {
        self.session = None;
        self.set_state(EngineState::Disposed);
    }

    fn load_model(&mut self, locator: &str) -> UpscaleResult<ExecutionBackend> {
        // free device memory held by the previous model before building the next
        self.session = None;
        self.set_state(EngineState::ModelLoading);
        let started = Instant::now();

        let result = self
            .loader
            .load(locator)
            .and_then(|bytes| self.factory.create(&bytes))
            .map_err(|e| UpscaleError::model_load(&e));

        match result {
            Ok(session) => {
                let backend = session.backend();
                self.session = Some(session);
                self.set_state(EngineState::Ready);
                info!(
                    %backend,
                    load_ms = format!("{:.0}", started.elapsed().as_secs_f64() * 1000.0),
                    "Model loaded"
                );
                Ok(backend)
            }
            Err(error) => {
                warn!(error = %error, "Model load failed");
                self.set_state(EngineState::Idle);
                Err(error)
            }
        }
    }

    fn upscale(
        &mut self,
        image: RasterImage,
        config: UpscaleConfig,
        cancel: &CancellationToken,
        events: &mpsc::Sender<UpscaleEvent>,
    ) {
        let Some(session) = self.session.as_deref_mut() else {
            send_terminal(events, UpscaleEvent::Failed(UpscaleError::ModelNotLoaded));
            return;
        };
        self.state.send_replace(EngineState::Upscaling);

        let mut observer = ChannelObserver { cancel, events };
        let limits = &self.limits;
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            upscale_raster(&image, &config, limits, session, &mut observer)
        }))
        .unwrap_or_else(|payload| {
            Err(UpscaleError::InferenceFailed(format!(
                "upscale panicked: {}",
                panic_payload_to_string(payload.as_ref())
            )))
        });

        let terminal = match result {
            Ok(output) => {
                self.set_state(EngineState::Complete);
                UpscaleEvent::Complete(output)
            }
            Err(error) => {
                if error == UpscaleError::Cancelled {
                    info!("Upscale cancelled");
                } else {
                    warn!(error = %error, "Upscale failed");
                }
                self.set_state(EngineState::Failed);
                UpscaleEvent::Failed(error)
            }
        };
        self.set_state(EngineState::Ready);
        send_terminal(events, terminal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_cache::{MemoryModelCache, ModelFetcher};
    use crate::tensor::Tensor;
    use anyhow::bail;
    use ndarray::IxDyn;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use url::Url;

    const MODEL_URL: &str = "https://models.example/stub-x2.onnx";

    struct StubFetcher;

    impl ModelFetcher for StubFetcher {
        fn fetch(&self, _url: &Url) -> Result<Vec<u8>> {
            Ok(b"stub-model".to_vec())
        }
    }

    /// Fills every scaled tile with `value`; fails the first `failures` calls
    /// and panics on the first `panics` calls after those.
    struct StubSession {
        value: f32,
        failures: usize,
        panics: usize,
        gate: Option<Gate>,
        dropped: Arc<AtomicBool>,
    }

    struct Gate {
        started: mpsc::UnboundedSender<()>,
        release: std::sync::mpsc::Receiver<()>,
    }

    impl TileInference for StubSession {
        fn run(&mut self, tile: &Tensor) -> Result<Tensor> {
            if let Some(gate) = &self.gate {
                let _ = gate.started.send(());
                let _ = gate.release.recv();
            }
            if self.failures > 0 {
                self.failures -= 1;
                bail!("stub inference failure");
            }
            if self.panics > 0 {
                self.panics -= 1;
                panic!("stub inference panic");
            }
            let (h, w) = (tile.shape()[2], tile.shape()[3]);
            Ok(Tensor::from_elem(IxDyn(&[1, 3, h * 2, w * 2]), self.value))
        }

        fn backend(&self) -> ExecutionBackend {
            ExecutionBackend::Cpu
        }
    }

    impl Drop for StubSession {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct StubFactory {
        fail: bool,
        delay: Option<Duration>,
        failures: usize,
        panics: usize,
        gate: Mutex<Option<Gate>>,
        created: AtomicUsize,
        dropped: Arc<AtomicBool>,
    }

    impl SessionFactory for StubFactory {
        fn create(&self, model: &[u8]) -> Result<Box<dyn TileInference>> {
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            if self.fail {
                bail!("corrupt model ({} bytes)", model.len());
            }
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(StubSession {
                value: 0.5,
                failures: self.failures,
                panics: self.panics,
                gate: self.gate.lock().unwrap().take(),
                dropped: self.dropped.clone(),
            }))
        }
    }

    fn engine_with(factory: Arc<StubFactory>, options: EngineOptions) -> UpscaleEngine {
        let loader = ModelLoader::new(Arc::new(MemoryModelCache::new()), Arc::new(StubFetcher));
        UpscaleEngine::spawn(factory, loader, options).unwrap()
    }

    fn gray_image(size: usize) -> RasterImage {
        RasterImage::new(size, size, vec![100; size * size * 4]).unwrap()
    }

    /// 16px input step: a 64x64 image needs a 3x3 grid.
    fn small_tiles() -> UpscaleConfig {
        UpscaleConfig {
            scale: 2,
            offset: 0,
            tile_size: 32,
        }
    }

    #[tokio::test]
    async fn test_upscale_before_load_fails() {
        let engine = engine_with(Arc::new(StubFactory::default()), EngineOptions::default());
        let job = engine
            .upscale(gray_image(16), UpscaleConfig::default())
            .await
            .unwrap();
        assert_eq!(job.wait(|_| {}).await, Err(UpscaleError::ModelNotLoaded));
        assert_eq!(engine.state(), EngineState::Idle);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_load_and_upscale() {
        let engine = engine_with(Arc::new(StubFactory::default()), EngineOptions::default());
        let backend = engine.load_model(MODEL_URL).await.unwrap();
        assert_eq!(backend, ExecutionBackend::Cpu);
        assert_eq!(engine.state(), EngineState::Ready);

        let mut job = engine
            .upscale(gray_image(64), UpscaleConfig::default())
            .await
            .unwrap();
        let mut events = Vec::new();
        while let Some(event) = job.next_event().await {
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                break;
            }
        }

        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            UpscaleEvent::Progress(UpscaleProgress::new(1, 1))
        );
        let UpscaleEvent::Complete(output) = &events[1] else {
            panic!("expected completion, got {:?}", events[1]);
        };
        assert_eq!((output.width(), output.height()), (128, 128));
        assert_eq!(output.pixel(0, 0), [128, 128, 128, 255]);
        assert_eq!(output.pixel(127, 127), [128, 128, 128, 255]);
        assert_eq!(engine.state(), EngineState::Ready);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_progress_is_ordered() {
        let engine = engine_with(Arc::new(StubFactory::default()), EngineOptions::default());
        engine.load_model(MODEL_URL).await.unwrap();
        let job = engine.upscale(gray_image(64), small_tiles()).await.unwrap();

        let mut seen = Vec::new();
        let output = job.wait(|p| seen.push(p)).await.unwrap();
        assert_eq!((output.width(), output.height()), (128, 128));
        assert_eq!(seen.len(), 9);
        for (i, progress) in seen.iter().enumerate() {
            assert_eq!(progress.current, i + 1);
            assert_eq!(progress.total, 9);
        }
        assert_eq!(seen.last().map(|p| p.percentage), Some(100));
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_load_returns_to_idle() {
        let factory = Arc::new(StubFactory {
            fail: true,
            ..Default::default()
        });
        let engine = engine_with(factory, EngineOptions::default());
        let err = engine.load_model(MODEL_URL).await.unwrap_err();
        match err {
            UpscaleError::ModelLoadFailed(message) => assert!(message.contains("corrupt model")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(engine.state(), EngineState::Idle);

        let job = engine.upscale(gray_image(8), UpscaleConfig::default()).await.unwrap();
        assert_eq!(job.wait(|_| {}).await, Err(UpscaleError::ModelNotLoaded));
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_then_recovery() {
        let factory = Arc::new(StubFactory {
            failures: 1,
            ..Default::default()
        });
        let engine = engine_with(factory, EngineOptions::default());
        engine.load_model(MODEL_URL).await.unwrap();

        let first = engine.upscale(gray_image(32), UpscaleConfig::default()).await.unwrap();
        assert!(matches!(
            first.wait(|_| {}).await,
            Err(UpscaleError::InferenceFailed(_))
        ));
        assert_eq!(engine.state(), EngineState::Ready);

        let second = engine.upscale(gray_image(32), UpscaleConfig::default()).await.unwrap();
        let output = second.wait(|_| {}).await.unwrap();
        assert_eq!((output.width(), output.height()), (64, 64));
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_guard_failure_keeps_engine_ready() {
        let engine = engine_with(Arc::new(StubFactory::default()), EngineOptions::default());
        engine.load_model(MODEL_URL).await.unwrap();

        let bad = UpscaleConfig {
            scale: 2,
            offset: 16,
            tile_size: 24,
        };
        let job = engine.upscale(gray_image(16), bad).await.unwrap();
        assert!(matches!(
            job.wait(|_| {}).await,
            Err(UpscaleError::InvalidConfig(_))
        ));
        assert_eq!(engine.state(), EngineState::Ready);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_stops_after_in_flight_tile() {
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let factory = Arc::new(StubFactory {
            gate: Mutex::new(Some(Gate {
                started: started_tx,
                release: release_rx,
            })),
            ..Default::default()
        });
        let engine = engine_with(factory, EngineOptions::default());
        engine.load_model(MODEL_URL).await.unwrap();

        let job = engine.upscale(gray_image(64), small_tiles()).await.unwrap();
        started_rx.recv().await.unwrap();
        job.cancel();
        for _ in 0..9 {
            release_tx.send(()).unwrap();
        }

        let mut progress = Vec::new();
        let result = job.wait(|p| progress.push(p)).await;
        assert_eq!(result, Err(UpscaleError::Cancelled));
        assert_eq!(progress, vec![UpscaleProgress::new(1, 9)]);
        assert_eq!(engine.state(), EngineState::Ready);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_session_panic_fails_only_that_job() {
        let factory = Arc::new(StubFactory {
            panics: 1,
            ..Default::default()
        });
        let engine = engine_with(factory.clone(), EngineOptions::default());
        engine.load_model(MODEL_URL).await.unwrap();

        let job = engine.upscale(gray_image(32), UpscaleConfig::default()).await.unwrap();
        match job.wait(|_| {}).await {
            Err(UpscaleError::InferenceFailed(message)) => {
                assert!(message.contains("stub inference panic"), "{message}")
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(engine.state(), EngineState::Ready);

        let next = engine.upscale(gray_image(32), UpscaleConfig::default()).await.unwrap();
        assert_eq!(next.wait(|_| {}).await.unwrap().width(), 64);
        engine.load_model(MODEL_URL).await.unwrap();
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_undrained_job_does_not_stall_the_engine() {
        let options = EngineOptions {
            event_buffer: 1,
            ..Default::default()
        };
        let engine = engine_with(Arc::new(StubFactory::default()), options);
        engine.load_model(MODEL_URL).await.unwrap();

        let mut stalled = engine.upscale(gray_image(64), small_tiles()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        stalled.cancel();

        let next = engine.upscale(gray_image(8), UpscaleConfig::default()).await.unwrap();
        let output = tokio::time::timeout(Duration::from_secs(3), next.wait(|_| {}))
            .await
            .expect("engine stalled behind an undrained job")
            .unwrap();
        assert_eq!(output.width(), 16);

        let mut events = Vec::new();
        while let Some(event) = stalled.next_event().await {
            events.push(event);
        }
        assert!(events.len() <= 2, "{events:?}");
        assert!(events.last().is_some_and(UpscaleEvent::is_terminal), "{events:?}");

        tokio::time::timeout(Duration::from_secs(3), engine.shutdown())
            .await
            .expect("shutdown stalled")
            .unwrap();
    }

    #[tokio::test]
    async fn test_slow_reader_loses_progress_but_gets_result() {
        let options = EngineOptions {
            event_buffer: 1,
            ..Default::default()
        };
        let engine = engine_with(Arc::new(StubFactory::default()), options);
        engine.load_model(MODEL_URL).await.unwrap();

        let mut unread = engine.upscale(gray_image(64), small_tiles()).await.unwrap();
        // served after the first job, so the first job has run to completion
        let marker = engine.upscale(gray_image(8), UpscaleConfig::default()).await.unwrap();
        marker.wait(|_| {}).await.unwrap();

        assert_eq!(
            unread.next_event().await,
            Some(UpscaleEvent::Progress(UpscaleProgress::new(1, 9)))
        );
        let Some(UpscaleEvent::Complete(output)) = unread.next_event().await else {
            panic!("expected completion after the buffered progress");
        };
        assert_eq!((output.width(), output.height()), (128, 128));
        assert_eq!(unread.next_event().await, None);
        engine.shutdown().await.unwrap();
    }

    #[test]
    fn test_panic_payload_to_string() {
        assert_eq!(panic_payload_to_string(&"boom"), "boom");
        assert_eq!(panic_payload_to_string(&"boom".to_string()), "boom");
        assert_eq!(panic_payload_to_string(&7u8), "<non-string panic payload>");
    }

    #[tokio::test]
    async fn test_load_timeout() {
        let factory = Arc::new(StubFactory {
            delay: Some(Duration::from_millis(500)),
            ..Default::default()
        });
        let options = EngineOptions {
            model_load_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let engine = engine_with(factory, options);
        let err = engine.load_model(MODEL_URL).await.unwrap_err();
        match err {
            UpscaleError::ModelLoadFailed(message) => assert!(message.contains("timed out")),
            other => panic!("unexpected error: {other:?}"),
        }
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_releases_session() {
        let factory = Arc::new(StubFactory::default());
        let dropped = factory.dropped.clone();
        let engine = engine_with(factory, EngineOptions::default());
        engine.load_model(MODEL_URL).await.unwrap();
        let mut state = engine.subscribe_state();
        assert!(!dropped.load(Ordering::SeqCst));

        engine.shutdown().await.unwrap();
        assert!(dropped.load(Ordering::SeqCst));
        assert_eq!(*state.borrow_and_update(), EngineState::Disposed);
    }

    #[tokio::test]
    async fn test_reload_replaces_session() {
        let factory = Arc::new(StubFactory::default());
        let engine = engine_with(factory.clone(), EngineOptions::default());
        engine.load_model(MODEL_URL).await.unwrap();
        engine.load_model(MODEL_URL).await.unwrap();
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
        assert!(factory.dropped.load(Ordering::SeqCst));
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_queued_jobs_run_in_order() {
        let engine = engine_with(Arc::new(StubFactory::default()), EngineOptions::default());
        engine.load_model(MODEL_URL).await.unwrap();

        let first = engine.upscale(gray_image(20), UpscaleConfig::default()).await.unwrap();
        let second = engine.upscale(gray_image(30), UpscaleConfig::default()).await.unwrap();

        let b = second.wait(|_| {}).await.unwrap();
        let a = first.wait(|_| {}).await.unwrap();
        assert_eq!((a.width(), b.width()), (40, 60));
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_engine_rejects_requests() {
        let engine = engine_with(Arc::new(StubFactory::default()), EngineOptions::default());
        let (reply_tx, reply_rx) = oneshot::channel();
        assert!(engine
            .requests
            .send(EngineRequest::Shutdown { reply: reply_tx })
            .await
            .is_ok());
        reply_rx.await.unwrap();

        // the worker has exited; the queue is closed once its receiver drops
        let mut state = engine.subscribe_state();
        assert_eq!(*state.borrow_and_update(), EngineState::Disposed);
        let start = Instant::now();
        while !engine.requests.is_closed() && start.elapsed() < Duration::from_secs(5) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(
            engine.load_model(MODEL_URL).await,
            Err(UpscaleError::EngineClosed)
        );
        assert!(matches!(
            engine.upscale(gray_image(8), UpscaleConfig::default()).await,
            Err(UpscaleError::EngineClosed)
        ));
    }
}
