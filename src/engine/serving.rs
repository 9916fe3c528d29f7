//! Admission API, token streams and the scheduling loop.
//!
//! The [`Engine`] runs on its own thread and is the only owner of the
//! [`Scheduler`]. Everything else talks to it through an [`EngineHandle`],
//! which forwards commands over an unbounded channel:
//!
//! ```text
//!  request handlers            scheduling thread
//!  ────────────────            ─────────────────
//!  EngineHandle::submit ──┐
//!  EngineHandle::cancel ──┼──► command queue ──► Engine::run
//!  TokenStream (drop)   ──┘                          │ step()
//!                                                    ▼
//!  TokenStream ◄──────────── per-request channel ◄── events
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{error, info, warn};

use crate::config::{EngineConfig, SamplingConfig};
use crate::core::allocator::{PoolGauge, PoolUsage};
use crate::core::sequence::{FinishReason, RequestId};
use crate::engine::executor::ForwardKernel;
use crate::error::{Error, ErrorKind, Result};
use crate::scheduler::orchestrator::{Scheduler, SchedulerStats};

/// One item of a request's token stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamEvent {
    /// Next generated token.
    Token(u32),
    /// Generation finished normally.
    Completed(FinishReason),
    /// Generation was terminated by an error.
    Aborted(ErrorKind),
    /// Generation was cancelled by the caller.
    Cancelled,
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Token(_))
    }
}

enum EngineCommand {
    Submit {
        request_id: RequestId,
        prompt: Vec<u32>,
        sampling: SamplingConfig,
        events: UnboundedSender<StreamEvent>,
    },
    Cancel(RequestId),
    Shutdown,
}

/// Cloneable entry point for submitting and cancelling requests.
#[derive(Clone)]
pub struct EngineHandle {
    commands: UnboundedSender<EngineCommand>,
    next_id: Arc<AtomicU64>,
    gauge: Arc<PoolGauge>,
}

impl EngineHandle {
    /// Submit a tokenized prompt.
    ///
    /// Returns the request id and the stream its tokens arrive on. Requests
    /// that can never fit are not rejected here; their stream ends with
    /// `Aborted(OversizedRequest)`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidRequest`] for an empty prompt or bad sampling values.
    /// - [`Error::EngineShutdown`] if the loop has stopped.
    pub fn submit(
        &self,
        prompt: Vec<u32>,
        sampling: SamplingConfig,
    ) -> Result<(RequestId, TokenStream)> {
        if prompt.is_empty() {
            return Err(Error::InvalidRequest("prompt is empty".into()));
        }
        sampling.validate()?;

        let request_id = RequestId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.commands
            .send(EngineCommand::Submit {
                request_id,
                prompt,
                sampling,
                events: tx,
            })
            .map_err(|_| Error::EngineShutdown)?;

        Ok((
            request_id,
            TokenStream {
                request_id,
                events: rx,
                commands: self.commands.clone(),
                finished: false,
            },
        ))
    }

    /// Cancel a request. Cancelling a finished or unknown request is a no-op.
    pub fn cancel(&self, request_id: RequestId) -> Result<()> {
        self.commands
            .send(EngineCommand::Cancel(request_id))
            .map_err(|_| Error::EngineShutdown)
    }

    /// Abort all in-flight requests and stop the loop.
    pub fn shutdown(&self) -> Result<()> {
        self.commands
            .send(EngineCommand::Shutdown)
            .map_err(|_| Error::EngineShutdown)
    }

    /// Current page-pool occupancy, readable from any thread.
    pub fn pool_usage(&self) -> PoolUsage {
        self.gauge.usage()
    }
}

/// Lazy, finite stream of one request's output.
///
/// Yields tokens in generation order and ends with exactly one terminal
/// event. Dropping the stream before then cancels the request.
pub struct TokenStream {
    request_id: RequestId,
    events: UnboundedReceiver<StreamEvent>,
    commands: UnboundedSender<EngineCommand>,
    finished: bool,
}

impl TokenStream {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Wait for the next event.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        let event = self.events.recv().await;
        self.observe(event)
    }

    /// Drain the stream, returning the tokens and the terminal event.
    ///
    /// Blocks the current thread; must not be called from async code.
    pub fn collect_all(mut self) -> (Vec<u32>, Option<StreamEvent>) {
        let mut tokens = Vec::new();
        for event in self.by_ref() {
            match event {
                StreamEvent::Token(token) => tokens.push(token),
                terminal => return (tokens, Some(terminal)),
            }
        }
        (tokens, None)
    }

    fn observe(&mut self, event: Option<StreamEvent>) -> Option<StreamEvent> {
        match event {
            Some(event) => {
                self.finished = event.is_terminal();
                Some(event)
            }
            None => {
                self.finished = true;
                None
            }
        }
    }
}

/// Blocking iteration; must not be used from async code.
impl Iterator for TokenStream {
    type Item = StreamEvent;

    fn next(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        let event = self.events.blocking_recv();
        self.observe(event)
    }
}

impl Drop for TokenStream {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.commands.send(EngineCommand::Cancel(self.request_id));
        }
    }
}

/// The scheduling loop.
pub struct Engine<K> {
    scheduler: Scheduler<K>,
    commands: UnboundedReceiver<EngineCommand>,
    streams: HashMap<RequestId, UnboundedSender<StreamEvent>>,
    shutting_down: bool,
}

impl<K: ForwardKernel + 'static> Engine<K> {
    /// Build an engine and the handle that feeds it.
    pub fn new(config: &EngineConfig, kernel: K) -> Result<(Self, EngineHandle)> {
        let scheduler = Scheduler::new(config, kernel)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = EngineHandle {
            commands: tx,
            next_id: Arc::new(AtomicU64::new(0)),
            gauge: scheduler.gauge(),
        };
        let engine = Self {
            scheduler,
            commands: rx,
            streams: HashMap::new(),
            shutting_down: false,
        };
        Ok((engine, handle))
    }

    /// Start the loop on a dedicated thread.
    ///
    /// The thread returns the final statistics once the engine is shut down,
    /// or once every handle and stream is gone and no work remains.
    pub fn spawn(
        config: &EngineConfig,
        kernel: K,
    ) -> Result<(EngineHandle, JoinHandle<Result<SchedulerStats>>)> {
        let (engine, handle) = Self::new(config, kernel)?;
        let join = thread::Builder::new()
            .name("nano-serve-scheduler".into())
            .spawn(move || engine.run())?;
        Ok((handle, join))
    }

    pub fn scheduler(&self) -> &Scheduler<K> {
        &self.scheduler
    }

    /// Drive the scheduler until shutdown.
    pub fn run(mut self) -> Result<SchedulerStats> {
        info!("scheduling loop started");
        loop {
            if self.scheduler.is_idle() && !self.shutting_down {
                // Suspend until the next command arrives.
                match self.commands.blocking_recv() {
                    Some(command) => self.handle(command),
                    None => break,
                }
            }
            while let Ok(command) = self.commands.try_recv() {
                self.handle(command);
            }

            if self.shutting_down {
                let events = self.scheduler.abort_all(ErrorKind::EngineShutdown);
                self.dispatch(events);
                break;
            }
            if self.scheduler.is_idle() {
                continue;
            }

            match self.scheduler.step() {
                Ok(report) => self.dispatch(report.events),
                Err(err) => {
                    error!(error = %err, "scheduler step failed, aborting all requests");
                    let events = self.scheduler.abort_all(err.kind());
                    self.dispatch(events);
                    return Err(err);
                }
            }
        }

        self.reject_pending();
        self.scheduler.teardown()?;
        let stats = self.scheduler.stats().clone();
        info!(
            steps = stats.steps,
            completed = stats.completed,
            aborted = stats.aborted,
            cancelled = stats.cancelled,
            "scheduling loop stopped"
        );
        Ok(stats)
    }

    fn handle(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Submit {
                request_id,
                prompt,
                sampling,
                events,
            } => {
                if self.shutting_down {
                    let _ = events.send(StreamEvent::Aborted(ErrorKind::EngineShutdown));
                    return;
                }
                match self.scheduler.admit(request_id, prompt, sampling) {
                    Ok(()) => {
                        self.streams.insert(request_id, events);
                    }
                    Err(err) => {
                        warn!(request_id = %request_id, error = %err, "request not admitted");
                        let _ = events.send(StreamEvent::Aborted(err.kind()));
                    }
                }
            }
            EngineCommand::Cancel(request_id) => {
                self.scheduler.cancel(request_id);
            }
            EngineCommand::Shutdown => {
                info!("shutdown requested");
                self.shutting_down = true;
            }
        }
    }

    fn dispatch(&mut self, events: Vec<(RequestId, StreamEvent)>) {
        for (request_id, event) in events {
            let terminal = event.is_terminal();
            if let Some(stream) = self.streams.get(&request_id) {
                // A closed receiver means the caller went away.
                if stream.send(event).is_err() && !terminal {
                    self.scheduler.cancel(request_id);
                }
            }
            if terminal {
                self.streams.remove(&request_id);
            }
        }
    }

    /// Fail submissions that raced with shutdown.
    fn reject_pending(&mut self) {
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let EngineCommand::Submit { events, .. } = command {
                let _ = events.send(StreamEvent::Aborted(ErrorKind::EngineShutdown));
            }
        }
    }
}
