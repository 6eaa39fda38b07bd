//! ReviewLoop - feeds the ReviewCoordinator.
//!
//! Two inputs: domain events (a task entering PendingReview opens a session)
//! and the system mailbox (reviewer verdicts and acknowledgements).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use crate::bus::{BusError, MessageBus};
use crate::domain::{DomainEvent, TaskStatus, WorkerId};
use crate::review::ReviewCoordinator;

/// Messages handled per mailbox pass.
const MAILBOX_BATCH: usize = 64;

pub struct ReviewLoop {
    reviews: Arc<ReviewCoordinator>,
    bus: Arc<MessageBus>,
    events: mpsc::UnboundedReceiver<DomainEvent>,
    mailbox: WorkerId,
    poll_interval: Duration,
}

impl ReviewLoop {
    pub fn new(
        reviews: Arc<ReviewCoordinator>,
        bus: Arc<MessageBus>,
        events: mpsc::UnboundedReceiver<DomainEvent>,
        mailbox: WorkerId,
        poll_interval: Duration,
    ) -> Self {
        Self {
            reviews,
            bus,
            events,
            mailbox,
            poll_interval,
        }
    }

    async fn on_event(&self, event: DomainEvent) {
        let DomainEvent::TaskTransitioned {
            task_id,
            to: TaskStatus::PendingReview,
            ..
        } = event
        else {
            return;
        };
        if let Err(e) = self.reviews.open(task_id).await {
            tracing::warn!(task_id = %task_id, error = %e, "could not open review");
        }
    }

    /// Handle up to one batch of mail. Failed messages are nacked so the bus
    /// retries and eventually escalates them.
    pub async fn drain_mailbox(&self) -> Result<usize, BusError> {
        let mut handled = 0;
        while handled < MAILBOX_BATCH {
            let Some(message) = self.bus.receive_next(&self.mailbox).await? else {
                break;
            };
            handled += 1;
            match self.reviews.handle_message(&message).await {
                Ok(_) => self.bus.ack(&self.mailbox, message.id).await?,
                Err(e) => {
                    tracing::warn!(message_id = %message.id, sender = %message.sender_id, error = %e, "review message rejected");
                    self.bus.nack(&self.mailbox, message.id, e.to_string()).await?;
                }
            }
        }
        Ok(handled)
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        match self.reviews.open_pending().await {
            Ok(opened) if !opened.is_empty() => {
                tracing::info!(count = opened.len(), "reviews opened for waiting tasks");
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "startup review scan failed"),
        }

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {}
                Some(event) = self.events.recv() => self.on_event(event).await,
                _ = ticker.tick() => {
                    if let Err(e) = self.drain_mailbox().await {
                        tracing::error!(error = %e, "review mailbox pass failed");
                    }
                }
            }
            if *shutdown.borrow() || shutdown.has_changed().is_err() {
                break;
            }
        }
        tracing::debug!("review loop stopped");
    }
}
