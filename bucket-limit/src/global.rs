use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use crate::AdmissionError;
use crate::deadline;
use crate::spawn;

type Waiter = oneshot::Sender<GlobalTicket>;

/// Process-wide lock engaged by global-scope 429s.
///
/// While it is locked no request from any bucket may be sent. Requests that
/// arrive meanwhile wait in a single FIFO queue which is drained one entry
/// at a time once the lock expires, re-checking the lock before each entry.
#[derive(Debug, Default)]
pub struct GlobalLimiter {
    state: Mutex<GlobalState>,
}

#[derive(Debug, Default)]
struct GlobalState {
    locked_until: Option<Instant>,
    queue: VecDeque<Waiter>,
    draining: bool,
}

/// Proof that a request passed the global gate.
///
/// The drainer releases the next waiter only after the previous ticket is
/// dropped, so hold it until the request has taken its place in its bucket.
#[derive(Debug)]
pub struct GlobalTicket {
    _done: Option<oneshot::Sender<()>>,
}

impl GlobalTicket {
    fn free() -> Self {
        Self { _done: None }
    }
}

/// Outcome of asking the global gate for admission.
#[derive(Debug)]
pub enum GlobalAdmission {
    /// Nothing locked and nobody waiting.
    Open,
    /// The request holds a place in the global queue.
    Queued(oneshot::Receiver<GlobalTicket>),
}

impl GlobalAdmission {
    pub async fn wait(self) -> Result<GlobalTicket, AdmissionError> {
        match self {
            Self::Open => Ok(GlobalTicket::free()),
            Self::Queued(rx) => rx.await.map_err(|_| AdmissionError::Closed),
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }
}

enum Step {
    Sleep(Instant),
    Release(Waiter),
}

impl GlobalState {
    fn is_locked(&self, now: Instant) -> bool {
        self.locked_until.is_some_and(|until| until > now)
    }
}

impl GlobalLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().is_locked(Instant::now())
    }

    /// Whether [`admit`](Self::admit) would pass straight through right now.
    pub fn is_open(&self) -> bool {
        let state = self.state.lock();
        !state.is_locked(Instant::now()) && state.queue.iter().all(|w| w.is_closed())
    }

    pub fn locked_until(&self) -> Option<Instant> {
        let state = self.state.lock();
        state.locked_until.filter(|until| *until > Instant::now())
    }

    pub fn queued(&self) -> usize {
        let state = self.state.lock();
        state.queue.iter().filter(|w| !w.is_closed()).count()
    }

    /// Lock for `duration` from now. An existing longer lock is kept.
    pub fn lock(&self, duration: Duration) {
        let until = deadline(Instant::now(), duration);
        let mut state = self.state.lock();
        let until = state.locked_until.map_or(until, |current| current.max(until));
        state.locked_until = Some(until);
        debug!(?duration, "global lock engaged");
    }

    /// Take a place at the back of the global queue. The place is held from
    /// this call on, whenever the admission is awaited.
    pub fn enqueue(self: &Arc<Self>) -> GlobalAdmission {
        self.join(false)
    }

    /// Pass the global gate, waiting behind everyone already queued.
    pub async fn admit(self: &Arc<Self>) -> Result<GlobalTicket, AdmissionError> {
        self.enqueue().wait().await
    }

    /// Wait for the gate again after a global 429, ahead of everyone queued.
    pub async fn requeue_front(self: &Arc<Self>) -> Result<GlobalTicket, AdmissionError> {
        self.join(true).wait().await
    }

    fn join(self: &Arc<Self>, front: bool) -> GlobalAdmission {
        let mut state = self.state.lock();
        let now = Instant::now();
        state.queue.retain(|w| !w.is_closed());
        if !state.is_locked(now) && state.queue.is_empty() {
            return GlobalAdmission::Open;
        }
        let (tx, rx) = oneshot::channel();
        if front {
            state.queue.push_front(tx);
        } else {
            state.queue.push_back(tx);
        }
        if !state.draining {
            state.draining = spawn(Arc::clone(self).drain()).is_some();
        }
        GlobalAdmission::Queued(rx)
    }

    async fn drain(self: Arc<Self>) {
        loop {
            let step = {
                let mut state = self.state.lock();
                let now = Instant::now();
                match state.locked_until {
                    Some(until) if until > now => Step::Sleep(until),
                    _ => match state.queue.pop_front() {
                        Some(waiter) => Step::Release(waiter),
                        None => {
                            state.draining = false;
                            return;
                        }
                    },
                }
            };

            match step {
                Step::Sleep(until) => tokio::time::sleep_until(until).await,
                Step::Release(waiter) => {
                    let (done, finished) = oneshot::channel();
                    let ticket = GlobalTicket { _done: Some(done) };
                    if waiter.send(ticket).is_ok() {
                        // Resolves when the ticket is dropped.
                        let _ = finished.await;
                    }
                }
            }
        }
    }
}
