//! The hub task and the handles used to reach it.
//!
//! A single task owns the subscriber map. Everything else talks to it over
//! one unbounded command channel, so publishing never waits on a slow
//! subscriber.

use std::collections::HashMap;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::{EventSink, HubEvent};
use crate::config::HubConfig;
use crate::{MailsinkError, Result};

enum Command {
    Subscribe {
        reply: oneshot::Sender<(u64, mpsc::Receiver<HubEvent>)>,
    },
    Unsubscribe {
        id: u64,
    },
    Publish(HubEvent),
    Count {
        reply: oneshot::Sender<usize>,
    },
}

/// Entry point for starting the hub.
pub struct Hub {
    commands: mpsc::UnboundedReceiver<Command>,
    shutdown: watch::Receiver<bool>,
    subscribers: HashMap<u64, mpsc::Sender<HubEvent>>,
    capacity: usize,
    next_id: u64,
}

impl Hub {
    /// Start the hub task.
    ///
    /// The task runs until `shutdown` becomes `true` or every
    /// [`HubHandle`] has been dropped. Remaining subscribers then see the
    /// end of their stream.
    pub fn spawn(config: &HubConfig, shutdown: watch::Receiver<bool>) -> (HubHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let hub = Hub {
            commands: rx,
            shutdown,
            subscribers: HashMap::new(),
            capacity: config.subscriber_capacity.max(1),
            next_id: 1,
        };
        let task = tokio::spawn(hub.run());
        (HubHandle { commands: tx }, task)
    }

    async fn run(mut self) {
        debug!(capacity = self.capacity, "Hub started");

        loop {
            if *self.shutdown.borrow() {
                break;
            }
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(subscribers = self.subscribers.len(), "Hub stopped");
        self.subscribers.clear();
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Subscribe { reply } => {
                let id = self.next_id;
                self.next_id += 1;
                let (tx, rx) = mpsc::channel(self.capacity);
                if reply.send((id, rx)).is_ok() {
                    self.subscribers.insert(id, tx);
                    debug!(subscriber = id, "Subscriber added");
                }
            }
            Command::Unsubscribe { id } => {
                if self.subscribers.remove(&id).is_some() {
                    debug!(subscriber = id, "Subscriber removed");
                }
            }
            Command::Publish(event) => self.broadcast(event),
            Command::Count { reply } => {
                let _ = reply.send(self.subscribers.len());
            }
        }
    }

    fn broadcast(&mut self, event: HubEvent) {
        trace!(kind = event.kind(), subscribers = self.subscribers.len(), "Publishing");
        self.subscribers
            .retain(|id, queue| match queue.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(subscriber = id, "Subscriber queue full, disconnecting");
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(subscriber = id, "Subscriber gone");
                    false
                }
            });
    }
}

/// Cloneable handle to a running hub.
#[derive(Clone, Debug)]
pub struct HubHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl HubHandle {
    /// Register a new subscriber.
    ///
    /// Fails with [`MailsinkError::Shutdown`] if the hub has stopped.
    pub async fn subscribe(&self) -> Result<Subscription> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Subscribe { reply })
            .map_err(|_| MailsinkError::Shutdown)?;
        let (id, events) = response.await.map_err(|_| MailsinkError::Shutdown)?;

        Ok(Subscription {
            id,
            events,
            commands: self.commands.downgrade(),
        })
    }

    /// Remove a subscriber. Unknown IDs are ignored.
    pub fn unsubscribe(&self, id: u64) {
        let _ = self.commands.send(Command::Unsubscribe { id });
    }

    /// Queue an event for every subscriber. Never blocks.
    pub fn publish(&self, event: HubEvent) {
        if self.commands.send(Command::Publish(event)).is_err() {
            trace!("Hub stopped, event dropped");
        }
    }

    /// Number of live subscribers.
    pub async fn subscriber_count(&self) -> Result<usize> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Count { reply })
            .map_err(|_| MailsinkError::Shutdown)?;
        response.await.map_err(|_| MailsinkError::Shutdown)
    }
}

impl EventSink for HubHandle {
    fn publish(&self, event: HubEvent) {
        HubHandle::publish(self, event);
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Subscribe { .. } => f.write_str("Subscribe"),
            Command::Unsubscribe { id } => write!(f, "Unsubscribe({id})"),
            Command::Publish(event) => write!(f, "Publish({})", event.kind()),
            Command::Count { .. } => f.write_str("Count"),
        }
    }
}

/// A live subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    events: mpsc::Receiver<HubEvent>,
    commands: mpsc::WeakUnboundedSender<Command>,
}

impl Subscription {
    /// Subscriber ID.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event, or `None` once the subscription has been closed by the
    /// hub (overflow or shutdown) and its queue drained.
    pub async fn recv(&mut self) -> Option<HubEvent> {
        self.events.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(commands) = self.commands.upgrade() {
            let _ = commands.send(Command::Unsubscribe { id: self.id });
        }
    }
}
