//! Command line interface.
//!
//! clap exits with status 2 on unknown flags or values and 0 on `--help`. The
//! CoAP argument rules clap cannot express (operation/path presence, URI
//! scheme, payload requirements) are checked by [`CoapArgs::resolve`] and
//! reported the same way.

use crate::config::MqttProfile;
use crate::transport::coap::{CoapEndpoint, CoapMethod};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Exit status for invalid arguments
pub const USAGE_EXIT_CODE: i32 = 2;

#[derive(Parser, Debug)]
#[command(name = "iotpub", version, about = "Publish demo telemetry over MQTT, STOMP or CoAP")]
pub struct Cli {
    /// Configuration file (defaults to <config dir>/iotpub/config.toml)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Publish device or gateway telemetry to an MQTT broker
    Mqtt {
        /// Topic table to cycle through (overrides the config file)
        #[arg(long, value_enum)]
        profile: Option<MqttProfile>,
    },
    /// Connect to the MQTT broker, hold the session, then disconnect
    MqttCheck {
        /// Seconds to keep the session open (overrides the config file)
        #[arg(long)]
        linger_secs: Option<u64>,
    },
    /// Send attribute updates to a STOMP destination
    Stomp,
    /// Issue CoAP requests
    Coap(CoapArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "UPPER")]
pub enum CoapOperation {
    Get,
    Put,
    Post,
    Delete,
    Discover,
    Observe,
}

impl fmt::Display for CoapOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CoapOperation::Get => "GET",
            CoapOperation::Put => "PUT",
            CoapOperation::Post => "POST",
            CoapOperation::Delete => "DELETE",
            CoapOperation::Discover => "DISCOVER",
            CoapOperation::Observe => "OBSERVE",
        };
        write!(f, "{}", name)
    }
}

impl CoapOperation {
    fn requires_payload(self) -> bool {
        matches!(self, CoapOperation::Put | CoapOperation::Post)
    }

    pub fn method(self) -> CoapMethod {
        match self {
            CoapOperation::Get | CoapOperation::Discover | CoapOperation::Observe => {
                CoapMethod::Get
            }
            CoapOperation::Put => CoapMethod::Put,
            CoapOperation::Post => CoapMethod::Post,
            CoapOperation::Delete => CoapMethod::Delete,
        }
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct CoapArgs {
    /// GET|PUT|POST|DELETE|DISCOVER|OBSERVE
    #[arg(short = 'o', long, value_enum, ignore_case = true)]
    pub operation: Option<CoapOperation>,

    /// Path of the request, coap://host[:port]/path
    #[arg(short = 'p', long)]
    pub path: Option<String>,

    /// Payload of the request
    #[arg(short = 'P', long, conflicts_with = "payload_file")]
    pub payload: Option<String>,

    /// File with the payload of the request
    #[arg(short = 'f', long = "payload-file", value_name = "FILE")]
    pub payload_file: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("Operation must be specified")]
    MissingOperation,

    #[error("Path must be specified")]
    MissingPath,

    #[error("Path must be conform to coap://host[:port]/path")]
    InvalidPath,

    #[error("Payload cannot be empty for a {0} request")]
    MissingPayload(CoapOperation),

    #[error("Cannot read payload file {path}: {source}")]
    PayloadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Fully validated CoAP invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapInvocation {
    pub operation: CoapOperation,
    pub endpoint: CoapEndpoint,
    pub payload: Option<Vec<u8>>,
}

impl CoapArgs {
    pub async fn resolve(self) -> Result<CoapInvocation, CliError> {
        let operation = self.operation.ok_or(CliError::MissingOperation)?;
        let path = self.path.ok_or(CliError::MissingPath)?;
        if !path.starts_with("coap://") {
            return Err(CliError::InvalidPath);
        }
        let endpoint = CoapEndpoint::parse(&path).map_err(|_| CliError::InvalidPath)?;

        let payload = match (self.payload, self.payload_file) {
            (Some(payload), _) => Some(payload.into_bytes()),
            (None, Some(file)) => Some(
                tokio::fs::read(&file)
                    .await
                    .map_err(|source| CliError::PayloadFile { path: file, source })?,
            ),
            (None, None) => None,
        };

        if operation.requires_payload() && payload.is_none() {
            return Err(CliError::MissingPayload(operation));
        }

        Ok(CoapInvocation {
            operation,
            endpoint,
            payload,
        })
    }
}

/// Usage text of the `coap` subcommand
pub fn coap_usage() -> String {
    let mut command = Cli::command();
    match command.find_subcommand_mut("coap") {
        Some(coap) => coap.render_help().to_string(),
        None => command.render_help().to_string(),
    }
}
