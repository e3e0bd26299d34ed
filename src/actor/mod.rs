use crate::election::Candidacy;
use crate::lock::AcquireReport;
use crate::session::SessionEvent;
use crate::watch::WatchEvent;
use crate::ElectionError;
use std::error::Error;
use std::fmt::Debug;
use tokio::sync::{mpsc, oneshot};

// Everything that can change the election's mind funnels through this one queue, so the state
// machine itself never needs a lock.
#[derive(Debug)]
pub(crate) enum Event {
    // Begin campaigning: create a session, start watching the lock.
    Start(Callback<(), ElectionError>),

    // Revoke if leader, then tear down watcher, renewal, lock and session in that order. The
    // callback fires once teardown is done.
    Stop(Callback<(), ElectionError>),

    // From session creation and the renewal timer.
    Session(SessionEvent),

    // Result of one acquisition cycle.
    Acquire(AcquireReport),

    // From the lock watcher.
    Watch(WatchEvent),
}

impl Event {
    /// A lost session must be acted on before anything else that's already queued. Otherwise a
    /// stale "lock is ours" observation could be applied first and keep a dead leader in office.
    fn is_urgent(&self) -> bool {
        matches!(self, Event::Session(SessionEvent::Lost { .. }))
    }
}

#[derive(Debug)]
pub(crate) struct Callback<O: Debug, E: Error>(oneshot::Sender<Result<O, E>>);

impl<O: Debug, E: Error> Callback<O, E> {
    pub(crate) fn send(self, message: Result<O, E>) {
        let _ = self.0.send(message);
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Election actor has exited")]
pub(crate) struct ActorExited;

/// Held by the user-facing handle. Dropping every `ActorClient` ends the event loop.
#[derive(Clone)]
pub(crate) struct ActorClient {
    sender: mpsc::Sender<Event>,
}

/// Held by background tasks, so they never keep the actor alive on their own.
#[derive(Clone)]
pub(crate) struct WeakActorClient {
    sender: mpsc::WeakSender<Event>,
}

impl ActorClient {
    pub(crate) fn new(buffer_size: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(buffer_size);
        (ActorClient { sender: tx }, rx)
    }

    pub(crate) fn weak(&self) -> WeakActorClient {
        WeakActorClient {
            sender: self.sender.downgrade(),
        }
    }

    pub(crate) async fn start(&self) -> Result<(), ElectionError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::Start(Callback(tx))).await?;
        rx.await.map_err(|_| ElectionError::ElectionExited)?
    }

    pub(crate) async fn stop(&self) -> Result<(), ElectionError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::Stop(Callback(tx))).await?;
        rx.await.map_err(|_| ElectionError::ElectionExited)?
    }

    async fn send(&self, event: Event) -> Result<(), ElectionError> {
        self.sender
            .send(event)
            .await
            .map_err(|_| ElectionError::ElectionExited)
    }
}

impl WeakActorClient {
    pub(crate) async fn session_event(&self, event: SessionEvent) -> Result<(), ActorExited> {
        self.send(Event::Session(event)).await
    }

    pub(crate) async fn acquire_report(&self, report: AcquireReport) -> Result<(), ActorExited> {
        self.send(Event::Acquire(report)).await
    }

    pub(crate) async fn watch_event(&self, event: WatchEvent) -> Result<(), ActorExited> {
        self.send(Event::Watch(event)).await
    }

    async fn send(&self, event: Event) -> Result<(), ActorExited> {
        let sender = self.sender.upgrade().ok_or(ActorExited)?;
        sender.send(event).await.map_err(|_| ActorExited)
    }
}

/// CandidacyActor is the election logic in actor model.
pub(crate) struct CandidacyActor {
    logger: slog::Logger,
    receiver: mpsc::Receiver<Event>,
    candidacy: Candidacy,
}

impl CandidacyActor {
    pub(crate) fn new(logger: slog::Logger, receiver: mpsc::Receiver<Event>, candidacy: Candidacy) -> Self {
        CandidacyActor {
            logger,
            receiver,
            candidacy,
        }
    }

    pub(crate) async fn run_event_loop(mut self) {
        while let Some(first) = self.receiver.recv().await {
            let mut window = vec![first];
            while let Ok(event) = self.receiver.try_recv() {
                window.push(event);
            }

            for event in prioritize(window) {
                self.handle_event(event);
            }
        }
        slog::debug!(self.logger, "Election event loop exited");
    }

    // This must NOT be async. Any long running work must be spawned on another task
    // and come back as an event to this actor.
    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Start(callback) => {
                self.candidacy.handle_start();
                callback.send(Ok(()));
            }
            Event::Stop(callback) => {
                self.candidacy.handle_stop(callback);
            }
            Event::Session(event) => {
                self.candidacy.handle_session_event(event);
            }
            Event::Acquire(report) => {
                self.candidacy.handle_acquire_report(report);
            }
            Event::Watch(event) => {
                self.candidacy.handle_watch_event(event);
            }
        }
    }
}

/// Stable reorder of one evaluation window: urgent events first, everything else in arrival order.
fn prioritize(window: Vec<Event>) -> Vec<Event> {
    let (mut ordered, rest): (Vec<Event>, Vec<Event>) = window.into_iter().partition(Event::is_urgent);
    ordered.extend(rest);
    ordered
}
