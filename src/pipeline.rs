use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use dicom::object::{FileDicomObject, InMemDicomObject};
use tracing::{debug, error, info};

use crate::{error::RejectionKind, store::PhiStore, transform::Transformer};

/// Upper bound on queued instances; producers block once it is reached.
const QUEUE_CAPACITY: usize = 1024;

/// One unit of ingest work from an external producer.
pub enum IngestItem {
    /// A dataset already parsed in memory (e.g. from a storage endpoint).
    Dataset(Box<FileDicomObject<InMemDicomObject>>),
    /// A file on disk to be read and anonymized.
    File(PathBuf),
}

enum WorkItem {
    Ingest { source: String, item: IngestItem },
    // Each worker exits on receiving one sentinel.
    Stop,
}

/// Fixed pool of worker threads draining a bounded FIFO of ingest items.
/// Every dequeued item ends as exactly one of: stored, skipped-duplicate,
/// or quarantined; failures never propagate out of a worker.
pub struct IngestPipeline {
    sender: Sender<WorkItem>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

impl IngestPipeline {
    pub fn start(transformer: Arc<Transformer>, worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        let (sender, receiver) = bounded::<WorkItem>(QUEUE_CAPACITY);
        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let receiver = receiver.clone();
            let transformer = Arc::clone(&transformer);
            let handle = thread::Builder::new()
                .name(format!("anon-worker-{}", index + 1))
                .spawn(move || {
                    debug!("worker start");
                    while let Ok(work) = receiver.recv() {
                        let (source, item) = match work {
                            WorkItem::Stop => break,
                            WorkItem::Ingest { source, item } => (source, item),
                        };
                        let outcome = match item {
                            IngestItem::Dataset(obj) => {
                                transformer.process_dataset(&source, *obj)
                            }
                            IngestItem::File(path) => transformer.process_file(&path),
                        };
                        match outcome {
                            Ok(()) => {}
                            Err(RejectionKind::AlreadyStored) => {
                                debug!("skipped duplicate from {source}")
                            }
                            Err(kind) => error!("rejected instance from {source}: {kind}"),
                        }
                    }
                    debug!("worker end");
                })
                .expect("failed to spawn anonymizer worker");
            workers.push(handle);
        }
        IngestPipeline {
            sender,
            workers: Mutex::new(workers),
            worker_count,
        }
    }

    /// Queue one item; blocks while the queue is at capacity.
    pub fn enqueue(&self, source: &str, item: IngestItem) {
        let work = WorkItem::Ingest {
            source: source.to_string(),
            item,
        };
        if self.sender.send(work).is_err() {
            error!("ingest queue is closed, dropping item from {source}");
        }
    }

    /// Send one sentinel per worker and wait for the queue to drain.
    /// No item in flight is abandoned.
    pub fn stop(&self) {
        let mut workers = self.workers.lock().expect("worker handle lock poisoned");
        if workers.is_empty() {
            return;
        }
        info!("Stopping anonymizer workers");
        for _ in 0..self.worker_count {
            let _ = self.sender.send(WorkItem::Stop);
        }
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Background persistence loop: on every tick, save the PHI store iff it
/// is dirty; on stop, perform a final save unconditionally.
pub struct Autosave {
    stop_sender: Sender<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Autosave {
    pub fn start(store: Arc<PhiStore>, interval: Duration) -> Self {
        let (stop_sender, stop_receiver) = bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("anon-model-saver".to_string())
            .spawn(move || {
                debug!("autosave start");
                loop {
                    match stop_receiver.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            if store.take_dirty() {
                                if let Err(e) = store.save() {
                                    error!("autosave failed, retrying next tick: {e}");
                                    store.mark_dirty();
                                }
                            }
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                            store.take_dirty();
                            if let Err(e) = store.save() {
                                error!("final save failed: {e}");
                            }
                            break;
                        }
                    }
                }
                debug!("autosave end");
            })
            .expect("failed to spawn autosave thread");
        Autosave {
            stop_sender,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Signal the loop and wait for its final save.
    pub fn stop(&self) {
        let _ = self.stop_sender.send(());
        if let Some(handle) = self
            .handle
            .lock()
            .expect("autosave handle lock poisoned")
            .take()
        {
            let _ = handle.join();
        }
    }
}
