//! Publisher loop with statum state machine
//!
//! # State Machine
//!
//! ```text
//! Connecting ──connect()──► Publishing ──run()──► Terminated
//! ```
//!
//! `Connecting` only knows how to open the transport. `Publishing` owns the
//! counter and the loop. `Terminated` is reached after the transport has been
//! disconnected. That happens when an iteration limit is hit, when the
//! shutdown token is cancelled, or when a failure ends the loop.

use super::payload::{now_nanos, Payload};
use super::topics::TopicTable;
use super::PublisherError;
use crate::transport::{Delivery, Transport, TransportError};
use statum::{machine, state};
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// What the loop does after a failed publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Print the failure and move on to the next counter
    Continue,
    /// Print the failure, disconnect and stop
    Terminate,
}

#[derive(Debug, Clone)]
pub struct PublishSettings {
    /// Pause before every publish
    pub interval: Duration,
    pub on_failure: FailurePolicy,
}

impl PublishSettings {
    pub fn new(interval: Duration, on_failure: FailurePolicy) -> Self {
        Self {
            interval,
            on_failure,
        }
    }
}

/// Result of a single loop iteration.
#[derive(Debug)]
pub enum PublishOutcome {
    Sent {
        counter: u64,
        topic: String,
        payload: Payload,
        delivery: Delivery,
    },
    Failed {
        counter: u64,
        topic: String,
        error: TransportError,
    },
}

impl fmt::Display for PublishOutcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PublishOutcome::Sent {
                topic,
                payload,
                delivery,
                ..
            } => {
                write!(f, "Send `{}` to topic `{}`", payload, topic)?;
                if let Some(response) = &delivery.response {
                    write!(f, "\n{}", response)?;
                }
                Ok(())
            }
            PublishOutcome::Failed { topic, error, .. } => {
                write!(f, "Failed to send message to topic {}: {}", topic, error)
            }
        }
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum PublisherState {
    Connecting, // Transport created, not yet connected
    Publishing, // Connected, loop may run
    Terminated, // Transport disconnected
}

/// Telemetry publisher with compile-time state safety via statum
///
/// Owns its transport exclusively for the lifetime of the process.
#[machine]
pub struct Publisher<S: PublisherState> {
    transport: Box<dyn Transport>,
    table: TopicTable,
    settings: PublishSettings,
    counter: u64,
}

impl<S: PublisherState> Publisher<S> {
    /// Counter value the next iteration would use, which is also the
    /// number of iterations performed so far.
    pub fn counter(&self) -> u64 {
        self.counter
    }
}

impl Publisher<Connecting> {
    pub fn create(
        transport: Box<dyn Transport>,
        table: TopicTable,
        settings: PublishSettings,
    ) -> Self {
        debug!(
            "Creating {} publisher for {} with {} route(s), interval {:?}",
            transport.protocol(),
            transport.endpoint(),
            table.cycle_length(),
            settings.interval
        );

        Self::new(transport, table, settings, 0)
    }

    /// Opens the transport and transitions to Publishing state
    pub async fn connect(mut self) -> Result<Publisher<Publishing>, PublisherError> {
        info!(
            "Connecting to {} broker at {}",
            self.transport.protocol(),
            self.transport.endpoint()
        );

        match self.transport.connect().await {
            Ok(()) => {
                info!("Connected to {}", self.transport.endpoint());
                Ok(self.transition())
            }
            Err(e) => {
                error!("Failed to connect to {}: {}", self.transport.endpoint(), e);
                Err(PublisherError::Connect(e))
            }
        }
    }
}

impl Publisher<Publishing> {
    /// Runs one iteration without the pause: build, publish, count.
    pub async fn publish_next(&mut self) -> PublishOutcome {
        let counter = self.counter;
        let (topic, payload) = self.table.resolve(counter, now_nanos());
        let topic = topic.to_string();

        let outcome = match self.transport.publish(&topic, &payload).await {
            Ok(delivery) => {
                debug!("Published #{} to {}", counter, topic);
                PublishOutcome::Sent {
                    counter,
                    topic,
                    payload,
                    delivery,
                }
            }
            Err(error) => {
                warn!("Publish #{} to {} failed: {}", counter, topic, error);
                PublishOutcome::Failed {
                    counter,
                    topic,
                    error,
                }
            }
        };

        self.counter += 1;
        outcome
    }

    /// Runs the loop. `limit` caps the number of iterations; `None` runs until
    /// `shutdown` is cancelled or a terminating failure occurs. Cancellation is
    /// honoured during the pause, so an in-flight publish always completes.
    pub async fn run(
        mut self,
        limit: Option<u64>,
        shutdown: CancellationToken,
    ) -> Result<Publisher<Terminated>, PublisherError> {
        info!(
            "Publishing every {:?} to {} ({:?} on failure)",
            self.settings.interval,
            self.transport.endpoint(),
            self.settings.on_failure
        );

        let mut iterations: u64 = 0;
        loop {
            if limit.is_some_and(|limit| iterations >= limit) {
                info!("Iteration limit of {} reached", iterations);
                break;
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested after {} iteration(s)", iterations);
                    break;
                }
                _ = tokio::time::sleep(self.settings.interval) => {}
            }
            let outcome = self.publish_next().await;
            println!("{}", outcome);
            iterations += 1;

            match outcome {
                PublishOutcome::Sent { counter, .. } => trace!("Iteration #{} done", counter),
                PublishOutcome::Failed { .. }
                    if self.settings.on_failure == FailurePolicy::Continue => {}
                PublishOutcome::Failed {
                    counter,
                    topic,
                    error,
                } => {
                    error!("Stopping publisher after failed publish #{}", counter);
                    self.close_transport().await;
                    return Err(PublisherError::Publish {
                        counter,
                        topic,
                        source: error,
                    });
                }
            }
        }

        self.close_transport().await;
        Ok(self.transition())
    }

    async fn close_transport(&mut self) {
        if let Err(e) = self.transport.disconnect().await {
            warn!("Disconnect from {} failed: {}", self.transport.endpoint(), e);
        }
    }
}

