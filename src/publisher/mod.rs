//! # Telemetry Publisher
//!
//! Connects through a [`Transport`](crate::transport::Transport), then on every
//! tick builds the payload for the current counter, publishes it to the topic
//! selected by `counter mod N` and prints the outcome.
//!
//! ```text
//! Connecting ──► Publishing ──► Terminated
//!     │              │  ▲
//!     ▼              └──┘ sleep, build, publish, print, counter += 1
//!   (exit)
//! ```
//!
//! There is no retry or reconnect logic here. A failed publish either moves on
//! to the next counter or ends the loop, depending on [`FailurePolicy`].

pub mod engine;
pub mod payload;
pub mod topics;


pub use engine::{
    Connecting, FailurePolicy, PublishOutcome, PublishSettings, Publisher, PublisherState,
    Publishing, Terminated,
};
pub use payload::{Payload, PayloadKind};
pub use topics::{TopicRoute, TopicTable};

use crate::transport::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PublisherError {
    #[error("Connect failed: {0}")]
    Connect(#[source] TransportError),

    #[error("Publish #{counter} to {topic} failed: {source}")]
    Publish {
        counter: u64,
        topic: String,
        #[source]
        source: TransportError,
    },
}
