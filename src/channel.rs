//! Channels connecting the operators of a running pipeline.
//!
//! A [`Channel`] is an append-only log of tokens written by exactly one
//! producer. The number of consumers is fixed when the channel is created, and
//! that number decides its [`Mode`]: with one consumer the channel is unicast,
//! with more it is a broadcast where every consumer reads every token in
//! producer order, each at its own pace. A slot is released as soon as every
//! declared consumer has moved past it.
//!
//! A [`ValueCell`] is the degenerate single-token channel used for results
//! that are produced once and read by anyone, such as a built index or a
//! collected set.
//!
//! Completion is explicit. A producer calls [`Sender::close`] when it is done;
//! a sender that is dropped without closing poisons the channel, so a
//! collector can never mistake a failed producer for a finished one.
//!
//! Every blocking wait observes the run's shared [`Abort`] signal.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::core::{ArcStr, Token};
use crate::error::{ChannelError, PipelineError};

/// Upper bound on a single condition-variable wait. Blocking waits wake up at
/// least this often to look at the abort signal.
pub(crate) const TICK: Duration = Duration::from_millis(20);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run-wide fail-fast signal.
///
/// The first primary error reported wins and is returned from the run; any
/// later error is only logged. Secondary errors (a consumer noticing that its
/// producer died, a wait interrupted by the abort) raise the flag but never
/// claim the slot.
#[derive(Default)]
pub struct Abort {
    flag: AtomicBool,
    first: Mutex<Option<PipelineError>>,
}

impl Abort {
    pub fn trigger(&self, error: PipelineError) {
        let mut first = lock(&self.first);

        if first.is_none() && !error.is_secondary() {
            tracing::debug!("Aborting run: {error}");
            *first = Some(error);
        } else {
            tracing::debug!("Suppressed error after abort: {error}");
        }

        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub(crate) fn take(&self) -> Option<PipelineError> {
        lock(&self.first).take()
    }
}

fn wait<'a, S>(
    ready: &Condvar,
    guard: MutexGuard<'a, S>,
    abort: &Abort,
    deadline: Option<Instant>,
) -> Result<MutexGuard<'a, S>, ChannelError> {
    if abort.is_set() {
        return Err(ChannelError::Aborted);
    }

    let tick = match deadline {
        Some(deadline) => {
            let now = Instant::now();
            if now >= deadline {
                return Err(ChannelError::TimedOut);
            }
            (deadline - now).min(TICK)
        }
        None => TICK,
    };

    let (guard, _) = ready
        .wait_timeout(guard, tick)
        .unwrap_or_else(PoisonError::into_inner);

    Ok(guard)
}

/// Delivery mode of a channel, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Exactly one consumer ever reads each token.
    Unicast,
    /// Every declared consumer independently receives every token.
    Broadcast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Open,
    Closed,
    Poisoned,
}

struct Log<T> {
    /// Absolute position of `buffer[0]`.
    base: usize,
    buffer: VecDeque<Token<T>>,
    /// Next position to read, one entry per declared consumer.
    cursors: Vec<usize>,
    subscribed: usize,
    sender_taken: bool,
    status: Status,
}

impl<T> Log<T> {
    fn end(&self) -> usize {
        self.base + self.buffer.len()
    }

    fn release(&mut self) {
        let min = self.cursors.iter().copied().min().unwrap_or(usize::MAX);
        while self.base < min && !self.buffer.is_empty() {
            self.buffer.pop_front();
            self.base += 1;
        }
    }
}

pub struct Channel<T> {
    name: ArcStr,
    mode: Mode,
    log: Mutex<Log<T>>,
    ready: Condvar,
    abort: Arc<Abort>,
}

impl<T> Channel<T> {
    pub fn new(name: impl AsRef<str>, consumers: usize, abort: Arc<Abort>) -> Arc<Self> {
        let mode = if consumers > 1 {
            Mode::Broadcast
        } else {
            Mode::Unicast
        };

        Arc::new(Self {
            name: Arc::from(name.as_ref()),
            mode,
            log: Mutex::new(Log {
                base: 0,
                buffer: VecDeque::new(),
                cursors: vec![0; consumers],
                subscribed: 0,
                sender_taken: false,
                status: Status::Open,
            }),
            ready: Condvar::new(),
            abort,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Number of tokens still held because some consumer has not read them yet.
    pub fn buffered(&self) -> usize {
        lock(&self.log).buffer.len()
    }

    /// Takes the producer side. A channel has exactly one producer.
    pub fn sender(self: &Arc<Self>) -> Result<Sender<T>, ChannelError> {
        let mut log = lock(&self.log);
        if log.sender_taken {
            return Err(ChannelError::AlreadyConsumed);
        }
        log.sender_taken = true;

        Ok(Sender {
            channel: self.clone(),
            closed: false,
        })
    }

    /// Claims the next free consumer slot.
    pub fn subscribe(self: &Arc<Self>) -> Result<Receiver<T>, ChannelError> {
        let mut log = lock(&self.log);
        if log.subscribed >= log.cursors.len() {
            return Err(ChannelError::AlreadyConsumed);
        }

        let slot = log.subscribed;
        log.subscribed += 1;

        Ok(Receiver {
            channel: self.clone(),
            slot,
        })
    }
}

/// Producer side of a [`Channel`].
pub struct Sender<T> {
    channel: Arc<Channel<T>>,
    closed: bool,
}

impl<T> Sender<T> {
    pub fn send(&self, token: Token<T>) {
        let mut log = lock(&self.channel.log);

        // Without consumers there is nobody to hand the token to.
        if log.cursors.is_empty() {
            return;
        }

        log.buffer.push_back(token);
        log.release();
        drop(log);
        self.channel.ready.notify_all();
    }

    /// Signals that no more tokens will be sent.
    pub fn close(mut self) {
        self.finish(Status::Closed);
    }

    fn finish(&mut self, status: Status) {
        if self.closed {
            return;
        }
        self.closed = true;

        let mut log = lock(&self.channel.log);
        log.status = status;
        drop(log);
        self.channel.ready.notify_all();
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        if !self.closed {
            tracing::debug!("Channel '{}' poisoned by its producer", self.channel.name);
            self.finish(Status::Poisoned);
        }
    }
}

/// Result of a non-blocking or bounded read.
#[derive(Debug)]
pub enum Recv<T> {
    Token(Token<T>),
    Empty,
    Closed,
}

/// Consumer side of a [`Channel`], bound to one consumer slot.
pub struct Receiver<T> {
    channel: Arc<Channel<T>>,
    slot: usize,
}

impl<T> Receiver<T> {
    pub fn name(&self) -> &str {
        &self.channel.name
    }

    fn next_slot(&self, log: &mut Log<T>) -> Result<Recv<T>, ChannelError> {
        let cursor = log.cursors[self.slot];

        if cursor < log.end() {
            let token = log.buffer[cursor - log.base].clone();
            log.cursors[self.slot] = cursor + 1;
            log.release();
            return Ok(Recv::Token(token));
        }

        match log.status {
            Status::Open => Ok(Recv::Empty),
            Status::Closed => Ok(Recv::Closed),
            Status::Poisoned => Err(ChannelError::ProducerFailed),
        }
    }

    /// Reads the next token, waiting at most until `deadline`.
    ///
    /// Returns `Ok(None)` once the producer closed the channel and every
    /// token was read.
    pub fn recv_until(&mut self, deadline: Option<Instant>) -> Result<Option<Token<T>>, ChannelError> {
        let channel = &self.channel;
        let mut log = lock(&channel.log);

        loop {
            match self.next_slot(&mut log)? {
                Recv::Token(token) => return Ok(Some(token)),
                Recv::Closed => return Ok(None),
                Recv::Empty => log = wait(&channel.ready, log, &channel.abort, deadline)?,
            }
        }
    }

    pub fn recv(&mut self) -> Result<Option<Token<T>>, ChannelError> {
        self.recv_until(None)
    }

    /// Reads the next token if one arrives within `timeout`.
    pub fn poll(&mut self, timeout: Duration) -> Result<Recv<T>, ChannelError> {
        let channel = &self.channel;
        let mut log = lock(&channel.log);

        match self.next_slot(&mut log)? {
            Recv::Empty if !timeout.is_zero() => {
                let deadline = Instant::now() + timeout;
                match wait(&channel.ready, log, &channel.abort, Some(deadline)) {
                    Ok(mut log) => self.next_slot(&mut log),
                    Err(ChannelError::TimedOut) => Ok(Recv::Empty),
                    Err(err) => Err(err),
                }
            }
            other => Ok(other),
        }
    }
}

impl<T> Iterator for Receiver<T> {
    type Item = Result<Token<T>, ChannelError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.recv().transpose()
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        // a consumer that goes away early must not pin the log forever
        let mut log = lock(&self.channel.log);
        log.cursors[self.slot] = usize::MAX;
        log.release();
    }
}

enum Slot<T> {
    Pending,
    Set(Token<T>),
    Poisoned,
}

/// Single-assignment, many-reader cell.
pub struct ValueCell<T> {
    name: ArcStr,
    slot: Mutex<Slot<T>>,
    taken: AtomicBool,
    ready: Condvar,
    abort: Arc<Abort>,
}

impl<T> ValueCell<T> {
    pub fn new(name: impl AsRef<str>, abort: Arc<Abort>) -> Arc<Self> {
        Arc::new(Self {
            name: Arc::from(name.as_ref()),
            slot: Mutex::new(Slot::Pending),
            taken: AtomicBool::new(false),
            ready: Condvar::new(),
            abort,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn setter(self: &Arc<Self>) -> Result<ValueSetter<T>, ChannelError> {
        if self.taken.swap(true, Ordering::SeqCst) {
            return Err(ChannelError::AlreadyConsumed);
        }

        Ok(ValueSetter {
            cell: Some(self.clone()),
        })
    }

    /// Waits for the value. Every reader observes the same token.
    pub fn get(&self, deadline: Option<Instant>) -> Result<Token<T>, ChannelError> {
        let mut slot = lock(&self.slot);

        loop {
            match &*slot {
                Slot::Set(token) => return Ok(token.clone()),
                Slot::Poisoned => return Err(ChannelError::ProducerFailed),
                Slot::Pending => slot = wait(&self.ready, slot, &self.abort, deadline)?,
            }
        }
    }

    pub fn is_set(&self) -> bool {
        matches!(&*lock(&self.slot), Slot::Set(_))
    }

    fn put(&self, value: Slot<T>) {
        *lock(&self.slot) = value;
        self.ready.notify_all();
    }
}

/// Producer side of a [`ValueCell`]. Dropping it unset poisons the cell.
pub struct ValueSetter<T> {
    cell: Option<Arc<ValueCell<T>>>,
}

impl<T> ValueSetter<T> {
    pub fn set(mut self, token: Token<T>) {
        if let Some(cell) = self.cell.take() {
            cell.put(Slot::Set(token));
        }
    }
}

impl<T> Drop for ValueSetter<T> {
    fn drop(&mut self) {
        if let Some(cell) = self.cell.take() {
            tracing::debug!("Value '{}' poisoned by its producer", cell.name);
            cell.put(Slot::Poisoned);
        }
    }
}
