//! Background document loading.
//!
//! Resolving a location and parsing it can take a while, so it runs on its
//! own thread. The window polls for the outcome from its event loop. Only the
//! most recent load matters: starting a new one cancels the previous, and an
//! outcome whose load id is no longer current is dropped on arrival.

use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Instant;

use anyhow::Result;
use log::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::engine::{DocumentEngine, DocumentHandle, DocumentRef};
use crate::payload::PayloadStore;

pub enum LoadOutcome {
    Loaded(DocumentHandle),
    Failed {
        location: DocumentRef,
        error: anyhow::Error,
    },
}

struct Pending {
    id: u64,
    location: DocumentRef,
    token: CancellationToken,
}

struct Finished {
    id: u64,
    location: DocumentRef,
    result: Result<DocumentHandle>,
}

pub struct DocumentLoader {
    engine: Arc<dyn DocumentEngine>,
    payloads: PayloadStore,
    next_id: u64,
    pending: Option<Pending>,
    tx: mpsc::Sender<Finished>,
    rx: mpsc::Receiver<Finished>,
}

impl DocumentLoader {
    pub fn new(engine: Arc<dyn DocumentEngine>, payloads: PayloadStore) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            engine,
            payloads,
            next_id: 0,
            pending: None,
            tx,
            rx,
        }
    }

    /// Start loading `location`, superseding any load still running.
    pub fn start(&mut self, location: DocumentRef) -> Result<()> {
        self.cancel();
        self.next_id += 1;
        let id = self.next_id;
        let token = CancellationToken::new();

        let engine = Arc::clone(&self.engine);
        let payloads = self.payloads.clone();
        let tx = self.tx.clone();
        let worker_token = token.clone();
        let worker_location = location.clone();
        thread::Builder::new()
            .name(format!("load-{id}"))
            .spawn(move || {
                let start = Instant::now();
                let result = payloads.resolve(&worker_location).and_then(|bytes| {
                    let document = engine.load(&bytes, &worker_token)?;
                    Ok(DocumentHandle::new(id, worker_location.clone(), document))
                });
                debug!(
                    "loader: load {id} of {worker_location} finished in {:.1}ms",
                    start.elapsed().as_secs_f64() * 1000.0
                );
                if worker_token.is_cancelled() {
                    return;
                }
                let _ = tx.send(Finished {
                    id,
                    location: worker_location,
                    result,
                });
            })?;

        debug!("loader: load {id} started for {location}");
        self.pending = Some(Pending {
            id,
            location,
            token,
        });
        Ok(())
    }

    /// Abandon the running load, if any.
    pub fn cancel(&mut self) {
        if let Some(pending) = self.pending.take() {
            debug!("loader: load {} of {} cancelled", pending.id, pending.location);
            pending.token.cancel();
        }
    }

    pub fn is_loading(&self) -> bool {
        self.pending.is_some()
    }

    /// Location of the load in progress.
    pub fn loading(&self) -> Option<&DocumentRef> {
        self.pending.as_ref().map(|p| &p.location)
    }

    /// Non-blocking: the outcome of the current load once it is done.
    pub fn poll(&mut self) -> Option<LoadOutcome> {
        while let Ok(finished) = self.rx.try_recv() {
            if let Some(outcome) = self.accept(finished) {
                return Some(outcome);
            }
        }
        None
    }

    /// Blocking variant of [`Self::poll`] for callers without an event loop.
    pub fn wait(&mut self, timeout: std::time::Duration) -> Option<LoadOutcome> {
        let deadline = Instant::now() + timeout;
        while self.pending.is_some() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let finished = self.rx.recv_timeout(remaining).ok()?;
            if let Some(outcome) = self.accept(finished) {
                return Some(outcome);
            }
        }
        None
    }

    fn accept(&mut self, finished: Finished) -> Option<LoadOutcome> {
        if self.pending.as_ref().map(|p| p.id) != Some(finished.id) {
            debug!("loader: dropping stale load {}", finished.id);
            return None;
        }
        self.pending = None;
        Some(match finished.result {
            Ok(handle) => {
                info!(
                    "loader: {} loaded, {} page(s)",
                    handle.location(),
                    handle.page_count()
                );
                LoadOutcome::Loaded(handle)
            }
            Err(error) => {
                warn!("loader: failed to load {}: {error:#}", finished.location);
                LoadOutcome::Failed {
                    location: finished.location,
                    error,
                }
            }
        })
    }
}

impl Drop for DocumentLoader {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Bitmap, LoadedDocument, PageSize};
    use std::time::Duration;

    struct Pages(u32);

    impl LoadedDocument for Pages {
        fn page_count(&self) -> u32 {
            self.0
        }
        fn page_size(&self, _: u32) -> Result<PageSize> {
            Ok(PageSize { width: 1.0, height: 1.0 })
        }
        fn render_page(&self, _: u32, _: f64, _: &CancellationToken) -> Result<Bitmap> {
            Ok(Bitmap::new(1, 1, Vec::new()))
        }
    }

    /// Page count is the payload length; an empty payload fails.
    struct LengthEngine;

    impl DocumentEngine for LengthEngine {
        fn load(&self, payload: &[u8], _: &CancellationToken) -> Result<Arc<dyn LoadedDocument>> {
            anyhow::ensure!(!payload.is_empty(), "empty deck");
            Ok(Arc::new(Pages(payload.len() as u32)))
        }
    }

    fn loader() -> (DocumentLoader, PayloadStore) {
        let store = PayloadStore::new();
        (DocumentLoader::new(Arc::new(LengthEngine), store.clone()), store)
    }

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn loads_registered_payload() {
        let (mut loader, store) = loader();
        let loc = store.register(vec![0; 4]);
        loader.start(loc.clone()).unwrap();
        assert!(loader.is_loading());

        let Some(LoadOutcome::Loaded(handle)) = loader.wait(WAIT) else {
            panic!("expected a loaded document");
        };
        assert_eq!(handle.location(), &loc);
        assert_eq!(handle.page_count(), 4);
        assert!(!loader.is_loading());
    }

    #[test]
    fn engine_failure_is_reported() {
        let (mut loader, store) = loader();
        loader.start(store.register(Vec::new())).unwrap();
        let Some(LoadOutcome::Failed { error, .. }) = loader.wait(WAIT) else {
            panic!("expected a failure");
        };
        assert!(error.to_string().contains("empty deck"));
    }

    #[test]
    fn newer_load_wins() {
        let (mut loader, store) = loader();
        loader.start(store.register(vec![0; 2])).unwrap();
        let second = store.register(vec![0; 9]);
        loader.start(second.clone()).unwrap();

        let Some(LoadOutcome::Loaded(handle)) = loader.wait(WAIT) else {
            panic!("expected a loaded document");
        };
        assert_eq!(handle.location(), &second);
        assert_eq!(handle.id(), 2);
    }

    #[test]
    fn cancelled_load_reports_nothing() {
        let (mut loader, store) = loader();
        loader.start(store.register(vec![0; 2])).unwrap();
        loader.cancel();
        assert!(loader.wait(Duration::from_millis(50)).is_none());
        std::thread::sleep(Duration::from_millis(50));
        assert!(loader.poll().is_none());
    }
}
