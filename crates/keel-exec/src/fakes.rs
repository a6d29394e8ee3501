//! In-memory fakes for step execution (testing)
//!
//! Provides `RecordingGetDelegate`, which records every lifecycle call, and
//! `FakeFetcher`, which answers fetches with a programmed result.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use keel_worker::{OutputStream, Volume};

use crate::delegate::{ExitStatus, GetDelegate, Origin, VersionInfo};
use crate::error::FetchError;
use crate::resource::{FetchRequest, Fetcher};

// ---------------------------------------------------------------------------
// RecordingGetDelegate
// ---------------------------------------------------------------------------

/// Delegate that remembers what it was told.
#[derive(Debug, Default)]
pub struct RecordingGetDelegate {
    initializing: AtomicUsize,
    starting: AtomicUsize,
    finished: Mutex<Vec<(ExitStatus, VersionInfo)>>,
    outputs: Mutex<Vec<(Origin, String)>>,
}

impl RecordingGetDelegate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initializing_calls(&self) -> usize {
        self.initializing.load(Ordering::SeqCst)
    }

    pub fn starting_calls(&self) -> usize {
        self.starting.load(Ordering::SeqCst)
    }

    pub fn finished_calls(&self) -> Vec<(ExitStatus, VersionInfo)> {
        self.finished.lock().unwrap().clone()
    }

    pub fn outputs(&self) -> Vec<(Origin, String)> {
        self.outputs.lock().unwrap().clone()
    }
}

impl GetDelegate for RecordingGetDelegate {
    fn initializing(&self) {
        self.initializing.fetch_add(1, Ordering::SeqCst);
    }

    fn starting(&self) {
        self.starting.fetch_add(1, Ordering::SeqCst);
    }

    fn finished(&self, status: ExitStatus, info: &VersionInfo) {
        self.finished.lock().unwrap().push((status, info.clone()));
    }

    fn output(&self, origin: &Origin, chunk: &str) {
        self.outputs
            .lock()
            .unwrap()
            .push((origin.clone(), chunk.to_string()));
    }
}

// ---------------------------------------------------------------------------
// FakeFetcher
// ---------------------------------------------------------------------------

/// Fetcher that returns one programmed answer and records every request.
pub struct FakeFetcher {
    answer: Mutex<Result<Arc<dyn Volume>, FetchError>>,
    output: Vec<String>,
    requests: Mutex<Vec<FetchRequest>>,
}

impl FakeFetcher {
    pub fn returning(volume: Arc<dyn Volume>) -> Self {
        Self::answering(Ok(volume))
    }

    pub fn failing_with(err: FetchError) -> Self {
        Self::answering(Err(err))
    }

    fn answering(answer: Result<Arc<dyn Volume>, FetchError>) -> Self {
        Self {
            answer: Mutex::new(answer),
            output: Vec::new(),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Write `lines` to the request's handler on every fetch.
    pub fn with_output(mut self, lines: &[&str]) -> Self {
        self.output = lines.iter().map(|l| l.to_string()).collect();
        self
    }

    pub fn set_answer(&self, answer: Result<Arc<dyn Volume>, FetchError>) {
        *self.answer.lock().unwrap() = answer;
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Fetcher for FakeFetcher {
    async fn fetch(
        &self,
        cancel: &CancellationToken,
        request: FetchRequest,
    ) -> Result<Arc<dyn Volume>, FetchError> {
        for line in &self.output {
            request.handler.write(OutputStream::Stdout, line);
        }
        self.requests.lock().unwrap().push(request);
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        self.answer.lock().unwrap().clone()
    }
}
