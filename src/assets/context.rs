use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::errors::{Error, Result};

/// Shared, advisory cancellation flag.
///
/// Setting it never interrupts work directly; loaders poll it at checkpoints
/// and monitored streams fail their next read.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Lock-free progress fraction shared between a worker and its task.
///
/// Writes are coalesced: readers only ever see the latest value.
#[derive(Debug, Clone, Default)]
pub struct ProgressCell {
    bits: Arc<AtomicU32>,
}

impl ProgressCell {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `fraction` clamped to `[0, 1]`. Never moves backwards.
    pub fn set(&self, fraction: f32) {
        let value = fraction.clamp(0.0, 1.0);
        let _ = self
            .bits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |old| {
                (value > f32::from_bits(old)).then_some(value.to_bits())
            });
    }

    #[inline]
    #[must_use]
    pub fn get(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Acquire))
    }
}

/// Pipeline checkpoints, in the order a load reaches them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Section {
    Document,
    Materials,
    Geometry,
    Skeleton,
    Animation,
    Textures,
    Clip,
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Section::Document => "document",
            Section::Materials => "materials",
            Section::Geometry => "geometry",
            Section::Skeleton => "skeleton",
            Section::Animation => "animation",
            Section::Textures => "textures",
            Section::Clip => "clip",
        };
        f.write_str(name)
    }
}

pub(crate) type SectionObserver = dyn Fn(Section) + Send + Sync;

/// Per-load state threaded through the parsers and the resolver.
#[derive(Clone, Default)]
pub struct LoadContext {
    cancel: CancellationToken,
    progress: ProgressCell,
    observer: Option<Arc<SectionObserver>>,
}

impl fmt::Debug for LoadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadContext")
            .field("cancel", &self.cancel)
            .field("progress", &self.progress.get())
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl LoadContext {
    #[must_use]
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            progress: ProgressCell::default(),
            observer: None,
        }
    }

    #[must_use]
    pub fn with_progress(mut self, progress: ProgressCell) -> Self {
        self.progress = progress;
        self
    }

    /// Registers a callback invoked (on the worker) each time a section completes.
    #[must_use]
    pub fn with_observer(mut self, observer: impl Fn(Section) + Send + Sync + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    #[inline]
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    #[inline]
    #[must_use]
    pub fn progress(&self) -> &ProgressCell {
        &self.progress
    }

    /// Marks `section` as done, then fails with [`Error::Cancelled`] if the
    /// load has been cancelled meanwhile.
    pub fn checkpoint(&self, section: Section) -> Result<()> {
        if let Some(observer) = &self.observer {
            observer(section);
        }
        self.check_cancelled()
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            log::debug!("Load cancelled at checkpoint");
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}
