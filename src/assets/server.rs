//! Async Load Task
//!
//! A [`LoadTask`] parses and resolves one asset on a worker thread, then
//! finishes on the thread that owns it: every [`LoadListener`] callback runs
//! inside [`LoadTask::poll`] or [`LoadTask::wait`], never on the worker.
//!
//! ```text
//! Idle -> Running(Parsing) -> Running(Building) -> Completed | Cancelled | Failed
//! ```
//!
//! The worker reports phase changes and its result over a channel; progress
//! is a shared fraction that `poll` reads, so intermediate values may be
//! skipped.

use std::fmt;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError};
use tokio::runtime::{Handle, Runtime};

use crate::animation::clip::AnimationData;
use crate::animation::player::AnimationPlayer;
use crate::assets::context::{CancellationToken, LoadContext, ProgressCell, Section, SectionObserver};
use crate::assets::io::{AssetResolver, MonitoredStream};
use crate::assets::loaders::{ParseRequest, load_model};
use crate::assets::model::ModelData;
use crate::assets::settings::LoadSettings;
use crate::assets::storage::{ModelHandle, ModelStorage};
use crate::errors::{Error, ErrorKind, Result};

/// Share of the progress bar spent reading the stream.
const READ_SHARE: f32 = 0.3;
const WAIT_SLICE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Reading the stream and building the document tree.
    Parsing,
    /// Extracting the model and resolving joints and clips.
    Building,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    Running(Phase),
    Completed,
    Cancelled,
    Failed(ErrorKind),
}

impl TaskState {
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Cancelled | TaskState::Failed(_))
    }
}

/// Callbacks of one load, all invoked on the thread that polls the task.
pub trait LoadListener {
    fn on_progress(&mut self, _fraction: f32) {}

    /// Runs on the originating thread before completion, e.g. to register
    /// renderer-side resources. An error fails the load.
    fn on_finalize(&mut self, _model: &mut ModelData) -> Result<()> {
        Ok(())
    }

    fn on_complete(&mut self, model: Arc<ModelData>);

    fn on_fail(&mut self, kind: ErrorKind, message: &str);
}

type ProgressFn = Box<dyn FnMut(f32)>;
type CompleteFn = Box<dyn FnMut(Arc<ModelData>)>;
type FailFn = Box<dyn FnMut(ErrorKind, &str)>;

/// Closure-backed [`LoadListener`].
#[derive(Default)]
pub struct Callbacks {
    progress: Option<ProgressFn>,
    complete: Option<CompleteFn>,
    fail: Option<FailFn>,
}

impl Callbacks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn on_progress(mut self, f: impl FnMut(f32) + 'static) -> Self {
        self.progress = Some(Box::new(f));
        self
    }

    #[must_use]
    pub fn on_complete(mut self, f: impl FnMut(Arc<ModelData>) + 'static) -> Self {
        self.complete = Some(Box::new(f));
        self
    }

    #[must_use]
    pub fn on_fail(mut self, f: impl FnMut(ErrorKind, &str) + 'static) -> Self {
        self.fail = Some(Box::new(f));
        self
    }
}

impl LoadListener for Callbacks {
    fn on_progress(&mut self, fraction: f32) {
        if let Some(f) = &mut self.progress {
            f(fraction);
        }
    }

    fn on_complete(&mut self, model: Arc<ModelData>) {
        if let Some(f) = &mut self.complete {
            f(model);
        }
    }

    fn on_fail(&mut self, kind: ErrorKind, message: &str) {
        match &mut self.fail {
            Some(f) => f(kind, message),
            None => log::error!("Load failed ({kind:?}): {message}"),
        }
    }
}

enum WorkerEvent {
    Phase(Phase),
    Finished(Box<Result<ModelData>>),
}

#[derive(Clone)]
enum RuntimeRef {
    Owned(Arc<Runtime>),
    Borrowed(Handle),
}

impl RuntimeRef {
    fn handle(&self) -> &Handle {
        match self {
            RuntimeRef::Owned(rt) => rt.handle(),
            RuntimeRef::Borrowed(handle) => handle,
        }
    }
}

/// Creates load tasks sharing one worker runtime, resolver and settings.
#[derive(Clone)]
pub struct AssetLoader {
    runtime: RuntimeRef,
    resolver: Arc<AssetResolver>,
    settings: LoadSettings,
    models: Arc<ModelStorage>,
}

impl fmt::Debug for AssetLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssetLoader")
            .field("resolver", &self.resolver)
            .field("settings", &self.settings)
            .field("models", &self.models.len())
            .finish_non_exhaustive()
    }
}

impl AssetLoader {
    /// Starts a dedicated multi-thread runtime for the workers.
    pub fn new(resolver: AssetResolver, settings: LoadSettings) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("asset-loader")
            .build()?;
        Ok(Self::from_runtime(RuntimeRef::Owned(Arc::new(runtime)), resolver, settings))
    }

    /// Spawns workers on an existing runtime.
    #[must_use]
    pub fn with_handle(handle: Handle, resolver: AssetResolver, settings: LoadSettings) -> Self {
        Self::from_runtime(RuntimeRef::Borrowed(handle), resolver, settings)
    }

    fn from_runtime(runtime: RuntimeRef, resolver: AssetResolver, settings: LoadSettings) -> Self {
        Self {
            runtime,
            resolver: Arc::new(resolver),
            settings,
            models: Arc::new(ModelStorage::new()),
        }
    }

    #[inline]
    #[must_use]
    pub fn settings(&self) -> &LoadSettings {
        &self.settings
    }

    #[inline]
    #[must_use]
    pub fn resolver(&self) -> &AssetResolver {
        &self.resolver
    }

    /// Models of completed tasks. The storage owns them: dropping a task
    /// leaves its model loaded until it is removed here.
    #[inline]
    #[must_use]
    pub fn models(&self) -> &Arc<ModelStorage> {
        &self.models
    }

    /// A player for `clip` using the loader's default loop mode.
    #[must_use]
    pub fn player(&self, clip: Arc<AnimationData>) -> AnimationPlayer {
        AnimationPlayer::with_settings(clip, &self.settings)
    }

    /// Creates an idle task for `uri`.
    pub fn task(&self, uri: impl Into<String>, listener: impl LoadListener + 'static) -> LoadTask {
        LoadTask {
            uri: uri.into(),
            state: TaskState::Idle,
            listener: Box::new(listener),
            runtime: self.runtime.clone(),
            resolver: Arc::clone(&self.resolver),
            settings: self.settings.clone(),
            models: Arc::clone(&self.models),
            cancel: CancellationToken::new(),
            progress: ProgressCell::new(),
            reported: 0.0,
            section_hook: None,
            receiver: None,
            model: None,
            handle: None,
        }
    }

    /// Creates and starts a task for `uri`.
    pub fn load(&self, uri: impl Into<String>, listener: impl LoadListener + 'static) -> LoadTask {
        let mut task = self.task(uri, listener);
        task.start();
        task
    }
}

/// One asset load. Not `Send`: it must stay on the thread that polls it.
///
/// Dropping a task that has not finished cancels its worker. A completed
/// model stays in [`AssetLoader::models`] either way.
pub struct LoadTask {
    uri: String,
    state: TaskState,
    listener: Box<dyn LoadListener>,

    runtime: RuntimeRef,
    resolver: Arc<AssetResolver>,
    settings: LoadSettings,
    models: Arc<ModelStorage>,

    cancel: CancellationToken,
    progress: ProgressCell,
    reported: f32,
    section_hook: Option<Arc<SectionObserver>>,
    receiver: Option<Receiver<WorkerEvent>>,

    model: Option<Arc<ModelData>>,
    handle: Option<ModelHandle>,
}

impl fmt::Debug for LoadTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadTask")
            .field("uri", &self.uri)
            .field("state", &self.state)
            .field("progress", &self.progress.get())
            .finish_non_exhaustive()
    }
}

impl LoadTask {
    #[inline]
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    #[inline]
    #[must_use]
    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Latest progress fraction published by the worker.
    #[inline]
    #[must_use]
    pub fn progress(&self) -> f32 {
        self.progress.get()
    }

    #[must_use]
    pub fn model(&self) -> Option<&Arc<ModelData>> {
        self.model.as_ref()
    }

    /// Storage handle of the completed model.
    #[must_use]
    pub fn handle(&self) -> Option<ModelHandle> {
        self.handle
    }

    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Registers a callback invoked on the worker each time a section
    /// completes, before the cancellation check at that checkpoint.
    /// Only takes effect if set before [`Self::start`].
    pub fn on_section(&mut self, hook: impl Fn(Section) + Send + Sync + 'static) {
        self.section_hook = Some(Arc::new(hook));
    }

    /// Schedules the worker phase. Does nothing unless the task is idle.
    pub fn start(&mut self) {
        if self.state != TaskState::Idle {
            return;
        }
        log::info!("Loading `{}`", self.uri);

        let (tx, rx) = flume::unbounded();
        self.receiver = Some(rx);
        self.state = TaskState::Running(Phase::Parsing);

        let uri = self.uri.clone();
        let resolver = Arc::clone(&self.resolver);
        let settings = self.settings.clone();
        let ctx = {
            let tx = tx.clone();
            let progress = self.progress.clone();
            let hook = self.section_hook.clone();
            LoadContext::new(self.cancel.clone())
                .with_progress(self.progress.clone())
                .with_observer(move |section| {
                    if section == Section::Document {
                        let _ = tx.send(WorkerEvent::Phase(Phase::Building));
                    }
                    progress.set(section_progress(section));
                    if let Some(hook) = &hook {
                        hook(section);
                    }
                })
        };

        // The JoinHandle is not needed: results arrive on the channel.
        let _ = self.runtime.handle().spawn_blocking(move || {
            let result = run_worker(&uri, &resolver, &settings, &ctx);
            let result = match result {
                Err(e) if ctx.cancellation().is_cancelled() => {
                    log::debug!("Worker for `{uri}` stopped after cancel: {e}");
                    Err(Error::Cancelled)
                }
                other => other,
            };
            let _ = tx.send(WorkerEvent::Finished(Box::new(result)));
        });
    }

    /// Requests cancellation. The task becomes `Cancelled` immediately; the
    /// worker stops at its next checkpoint or read and its result is dropped.
    pub fn cancel(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        log::info!("Cancelling load of `{}`", self.uri);
        self.cancel.cancel();
        self.receiver = None;
        self.state = TaskState::Cancelled;
    }

    /// Forwards progress and handles any worker events without blocking.
    /// Must be called on the originating thread, e.g. once per frame.
    pub fn poll(&mut self) -> TaskState {
        if !matches!(self.state, TaskState::Running(_)) {
            return self.state;
        }
        self.report_progress();

        let events: Vec<WorkerEvent> = match &self.receiver {
            Some(rx) => rx.try_iter().collect(),
            None => Vec::new(),
        };
        for event in events {
            self.handle_event(event);
            if self.state.is_terminal() {
                return self.state;
            }
        }

        // Disconnected first: once it holds, nothing more can be queued.
        if self.receiver.as_ref().is_some_and(|rx| rx.is_disconnected() && rx.is_empty()) {
            self.worker_lost();
        }
        self.state
    }

    /// Blocks the calling thread until the task is terminal, dispatching
    /// callbacks on it as events arrive.
    pub fn wait(&mut self) -> TaskState {
        loop {
            let state = self.poll();
            if state.is_terminal() || state == TaskState::Idle {
                return state;
            }
            let next = self.receiver.as_ref().map(|rx| rx.recv_timeout(WAIT_SLICE));
            match next {
                Some(Ok(event)) => self.handle_event(event),
                Some(Err(RecvTimeoutError::Timeout)) => {}
                Some(Err(RecvTimeoutError::Disconnected)) | None => self.worker_lost(),
            }
        }
    }

    fn report_progress(&mut self) {
        let current = self.progress.get();
        if current > self.reported {
            self.reported = current;
            self.listener.on_progress(current);
        }
    }

    fn handle_event(&mut self, event: WorkerEvent) {
        if self.state.is_terminal() {
            return;
        }
        match event {
            WorkerEvent::Phase(phase) => {
                log::debug!("`{}` entered {phase:?}", self.uri);
                self.state = TaskState::Running(phase);
            }
            WorkerEvent::Finished(result) => {
                self.receiver = None;
                match *result {
                    Ok(model) => self.finalize(model),
                    Err(e) => self.fail(e),
                }
            }
        }
    }

    fn worker_lost(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.receiver = None;
        let err = Error::stream(&self.uri, std::io::Error::other("load worker terminated unexpectedly"));
        self.fail(err);
    }

    /// Originating-thread phase.
    fn finalize(&mut self, mut model: ModelData) {
        if self.cancel.is_cancelled() {
            self.state = TaskState::Cancelled;
            return;
        }
        if let Err(e) = self.listener.on_finalize(&mut model) {
            self.fail(e);
            return;
        }
        if let Some(size) = self.settings.fit_size {
            model.root_transform = model.fit_transform(size, self.settings.fit_center);
        }

        let model = Arc::new(model);
        self.handle = Some(self.models.add_shared(model.id, Arc::clone(&model)));
        self.model = Some(Arc::clone(&model));
        self.state = TaskState::Completed;
        log::info!(
            "Loaded `{}`: {} mesh(es), {} clip(s)",
            self.uri,
            model.meshes.len(),
            model.animations.len()
        );

        self.progress.set(1.0);
        self.report_progress();
        self.listener.on_complete(model);
    }

    fn fail(&mut self, err: Error) {
        if matches!(err, Error::Cancelled) {
            self.state = TaskState::Cancelled;
            return;
        }
        let kind = err.kind();
        log::warn!("Failed to load `{}`: {err}", self.uri);
        self.state = TaskState::Failed(kind);
        self.listener.on_fail(kind, &err.to_string());
    }
}

impl Drop for LoadTask {
    fn drop(&mut self) {
        if matches!(self.state, TaskState::Running(_)) {
            log::debug!("Dropping running load of `{}`", self.uri);
            self.cancel.cancel();
        }
    }
}

fn section_progress(section: Section) -> f32 {
    match section {
        Section::Document => 0.4,
        Section::Materials => 0.5,
        Section::Geometry => 0.6,
        Section::Skeleton => 0.7,
        Section::Animation => 0.8,
        Section::Textures => 0.9,
        Section::Clip => 0.0,
    }
}

/// Worker phase: read, parse, build and resolve.
fn run_worker(uri: &str, resolver: &AssetResolver, settings: &LoadSettings, ctx: &LoadContext) -> Result<ModelData> {
    let stream = resolver.open(uri)?;
    let total = stream.len();
    let mut stream = MonitoredStream::new(stream, ctx.cancellation().clone(), total)
        .with_progress(ctx.progress().clone(), READ_SHARE);

    let mut bytes = Vec::with_capacity(total.unwrap_or(0) as usize);
    stream.read_to_end(&mut bytes).map_err(|e| Error::stream(uri, e))?;
    drop(stream);
    ctx.check_cancelled()?;

    load_model(
        &bytes,
        &ParseRequest {
            uri,
            resolver,
            settings,
            ctx,
        },
    )
}
