//! The parallel preprocessing pipeline that keeps the geometry sidecar in
//! sync with the vocabulary during bulk construction.
//!
//! Three stages connected by bounded queues: the caller thread assigns the
//! next index and enqueues the word (blocking while the queue is full), N
//! workers parse WKT and publish their outcome into an index-keyed map, and
//! one writer thread drains that map strictly in index order so the sidecar
//! ends up in insertion order no matter how the workers finish.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};

use super::geo::{GeoSidecarWriter, GeometryInfo, GeometryOutcome};
use super::WordWriter;
use crate::{EngineConfig, InternalError, Result};

struct WorkItem {
    index: u64,
    word: String,
}

/// End-of-run diagnostics of one writer run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GeoWriterStats {
    /// Words whose WKT did not parse; they got the sentinel record.
    pub invalid_geometries: u64,
    /// Polygons whose computed area was not a finite number.
    pub invalid_areas: u64,
}

enum WorkerResult {
    Parsed(GeometryOutcome),
    /// The caller already knows this word is no geometry; it gets the
    /// sentinel without touching a worker or the invalid counter.
    Skipped,
}

#[derive(Default)]
struct ResultState {
    results: BTreeMap<u64, WorkerResult>,
    /// Set once the workers are joined; tells the writer to drain and exit.
    ingest_done: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<ResultState>,
    ready: Condvar,
}

/// Wraps any [`WordWriter`] and maintains the geometry sidecar alongside
/// it. Assigned indices are returned synchronously from `push_word`; the
/// sidecar record for index `i` is written by the pipeline, in order.
pub struct GeoWordWriter<W> {
    inner: W,
    next_index: u64,
    work: Option<Sender<WorkItem>>,
    workers: Vec<JoinHandle<()>>,
    writer: Option<JoinHandle<io::Result<GeoWriterStats>>>,
    shared: Arc<Shared>,
    stats: GeoWriterStats,
    finished: bool,
}

impl<W: WordWriter> GeoWordWriter<W> {
    pub fn new(inner: W, sidecar_path: &Path, config: &EngineConfig) -> Result<GeoWordWriter<W>> {
        let (work_sender, work_receiver) =
            crossbeam_channel::bounded::<WorkItem>(config.queue_capacity as usize);
        let shared = Arc::new(Shared::default());

        let worker_count = config.effective_worker_count();
        let mut workers = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let receiver: Receiver<WorkItem> = work_receiver.clone();
            let shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("geo-worker-{i}"))
                .spawn(move || worker_loop(receiver, shared))?;
            workers.push(handle);
        }
        drop(work_receiver);

        let sidecar = GeoSidecarWriter::create(sidecar_path)?;
        let writer = thread::Builder::new()
            .name("geo-writer".into())
            .spawn({
                let shared = shared.clone();
                move || writer_loop(sidecar, shared)
            })?;

        Ok(GeoWordWriter {
            inner,
            next_index: 0,
            work: Some(work_sender),
            workers,
            writer: Some(writer),
            shared,
            stats: GeoWriterStats::default(),
            finished: false,
        })
    }

    pub fn stats(&self) -> GeoWriterStats {
        debug_assert!(self.finished, "stats are only complete after finish");
        self.stats
    }

    fn finish_pipeline(&mut self) -> Result<u64> {
        if self.finished {
            return Ok(self.next_index);
        }
        self.finished = true;

        // Closing the work queue lets the workers drain it and exit.
        drop(self.work.take());
        let mut worker_panicked = false;
        for worker in self.workers.drain(..) {
            worker_panicked |= worker.join().is_err();
        }

        // Only after the workers are gone can no further result arrive.
        self.shared.state.lock().unwrap().ingest_done = true;
        self.shared.ready.notify_all();

        let writer_result = self
            .writer
            .take()
            .expect("the writer thread is present until finish")
            .join();

        // Errors surface only once every thread is joined.
        if worker_panicked {
            return Err(InternalError::GeoPipelinePanicked.into());
        }
        match writer_result {
            Ok(Ok(stats)) => self.stats = stats,
            Ok(Err(io_error)) => return Err(io_error.into()),
            Err(_) => return Err(InternalError::GeoPipelinePanicked.into()),
        }

        self.inner.finish()?;
        tracing::debug!(
            words = self.next_index,
            invalid_geometries = self.stats.invalid_geometries,
            invalid_areas = self.stats.invalid_areas,
            "geo vocabulary writer finished"
        );
        Ok(self.next_index)
    }
}

impl<W: WordWriter> WordWriter for GeoWordWriter<W> {
    fn push_word(&mut self, word: &str, is_external: bool) -> Result<u64> {
        let index = self.inner.push_word(word, is_external)?;
        debug_assert_eq!(index, self.next_index);
        self.next_index += 1;
        // Blocks while the queue is full; fails only if every worker died.
        self.work
            .as_ref()
            .expect("push_word must not be called after finish")
            .send(WorkItem { index, word: word.to_owned() })
            .map_err(|_| InternalError::GeoPipelinePanicked)?;
        Ok(index)
    }

    fn finish(&mut self) -> Result<u64> {
        self.finish_pipeline()
    }
}

impl<W: WordWriter> GeoWordWriter<W> {
    /// Pushes a word the caller has already classified as not being a
    /// geometry; the sidecar receives the sentinel record directly.
    pub fn push_word_skipping_geometry(&mut self, word: &str, is_external: bool) -> Result<u64> {
        let index = self.inner.push_word(word, is_external)?;
        debug_assert_eq!(index, self.next_index);
        self.next_index += 1;
        self.shared.state.lock().unwrap().results.insert(index, WorkerResult::Skipped);
        self.shared.ready.notify_all();
        Ok(index)
    }
}

impl<W> Drop for GeoWordWriter<W> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // A partial sidecar must never survive this writer. There is no way
        // to report the failure from a destructor, so tear the process down.
        self.finished = true;
        drop(self.work.take());
        let mut failed = false;
        for worker in self.workers.drain(..) {
            failed |= worker.join().is_err();
        }
        self.shared.state.lock().unwrap().ingest_done = true;
        self.shared.ready.notify_all();
        if let Some(writer) = self.writer.take() {
            failed |= !matches!(writer.join(), Ok(Ok(_)));
        }
        if failed {
            tracing::error!("geometry pipeline failed during teardown, aborting");
            std::process::abort();
        }
    }
}

fn worker_loop(receiver: Receiver<WorkItem>, shared: Arc<Shared>) {
    // The iterator ends when the caller closes the queue.
    for WorkItem { index, word } in receiver {
        let outcome = GeometryInfo::from_wkt(&word);
        shared.state.lock().unwrap().results.insert(index, WorkerResult::Parsed(outcome));
        shared.ready.notify_all();
    }
}

fn writer_loop(mut sidecar: GeoSidecarWriter, shared: Arc<Shared>) -> io::Result<GeoWriterStats> {
    let mut stats = GeoWriterStats::default();
    let mut next = 0u64;
    loop {
        let outcome = {
            let mut state = shared.state.lock().unwrap();
            loop {
                if let Some(outcome) = state.results.remove(&next) {
                    break Some(outcome);
                }
                if state.ingest_done {
                    break None;
                }
                state = shared.ready.wait(state).unwrap();
            }
        };
        let Some(result) = outcome else { break };
        match result {
            WorkerResult::Parsed(outcome) => {
                if outcome.info.is_none() {
                    stats.invalid_geometries += 1;
                }
                if outcome.invalid_area {
                    stats.invalid_areas += 1;
                }
                sidecar.write_record(outcome.info.as_ref())?;
            }
            WorkerResult::Skipped => sidecar.write_record(None)?,
        }
        next += 1;
    }
    sidecar.finish()?;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::vocabulary::geo::{sidecar_path, GeoSidecar};
    use crate::vocabulary::{Vocabulary, VocabularyRead, VocabularyWriter};

    fn test_config() -> EngineConfig {
        EngineConfig { worker_count: 4, queue_capacity: 64, ..EngineConfig::default() }
    }

    #[test]
    fn on_disk_order_equals_insertion_order() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("vocabulary");
        let sidecar = sidecar_path(&base);
        let inner = VocabularyWriter::new(&base).unwrap();
        let mut writer = GeoWordWriter::new(inner, &sidecar, &test_config()).unwrap();

        // Interleave valid points, valid polygons, and garbage.
        let words: Vec<String> = (0..1000)
            .map(|i| match i % 3 {
                0 => format!("POINT({} {})", i % 90, (i * 7) % 90),
                1 => format!("POLYGON((0 0, {} 0, {} {}, 0 0))", i % 50 + 1, i % 50 + 1, i % 30 + 1),
                _ => format!("garbage number {i}"),
            })
            .collect();
        for word in &words {
            writer.push_word(word, false).unwrap();
        }
        assert_eq!(writer.finish().unwrap(), words.len() as u64);
        // finish is idempotent
        assert_eq!(writer.finish().unwrap(), words.len() as u64);
        let stats = writer.stats();
        assert_eq!(stats.invalid_geometries, words.iter().filter(|w| w.starts_with("garbage")).count() as u64);
        drop(writer);

        let vocabulary = Vocabulary::open(&base).unwrap();
        assert_eq!(vocabulary.len(), words.len() as u64);
        let sidecar = GeoSidecar::open(&sidecar, words.len() as u64).unwrap();
        for (i, word) in words.iter().enumerate() {
            assert_eq!(vocabulary.word(i as u64).unwrap(), *word);
            // Every record matches the single-threaded reference computation.
            let reference = GeometryInfo::from_wkt(word).info;
            assert_eq!(sidecar.get(i as u64), reference, "record {i}");
        }
    }

    #[test]
    fn empty_run_produces_an_empty_sidecar() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("vocabulary");
        let sidecar = sidecar_path(&base);
        let inner = VocabularyWriter::new(&base).unwrap();
        let mut writer = GeoWordWriter::new(inner, &sidecar, &test_config()).unwrap();
        assert_eq!(writer.finish().unwrap(), 0);
        assert_eq!(writer.stats(), GeoWriterStats::default());
        let sidecar = GeoSidecar::open(&sidecar, 0).unwrap();
        assert!(sidecar.is_empty());
    }
}
