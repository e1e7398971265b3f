pub mod cli;
pub mod config;
pub mod publisher;
pub mod transport;

use crate::cli::{Cli, CoapInvocation, CoapOperation, Command, USAGE_EXIT_CODE};
use crate::config::{AppConfig, ConfigSource, MqttConfig, MqttProfile};
use crate::publisher::{
    FailurePolicy, PayloadKind, PublishSettings, Publisher, PublisherError, TopicTable,
};
use crate::transport::coap::CoapTransport;
use crate::transport::mqtt::{ConnectionState, MqttSettings, MqttTransport};
use crate::transport::stomp::{StompSettings, StompTransport};
use crate::transport::Transport;
use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Exit status when a broker cannot be reached or the loop fails
const FAILURE_EXIT_CODE: u8 = 1;
const SUCCESS_EXIT_CODE: u8 = 0;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    setup()?;

    let (config, source) = AppConfig::load(cli.config.as_deref()).await?;
    setup_logging_env(config.logging.level()?);
    match source {
        ConfigSource::File(path) => info!("Loaded configuration from {}", path.display()),
        ConfigSource::Defaults => info!("No configuration file found, using defaults"),
    }

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_ctrl_c(shutdown.clone()));

    let status = dispatch(cli.command, &config, shutdown).await?;
    Ok(ExitCode::from(status))
}

async fn cancel_on_ctrl_c(shutdown: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("Shutdown signal received");
            shutdown.cancel();
        }
        Err(e) => warn!("Cannot listen for Ctrl-C: {}", e),
    }
}

/// Runs one subcommand and returns the process exit status.
async fn dispatch(
    command: Command,
    config: &AppConfig,
    shutdown: CancellationToken,
) -> Result<u8> {
    match command {
        Command::Mqtt { profile } => run_mqtt(&config.mqtt, profile, shutdown).await,
        Command::MqttCheck { linger_secs } => {
            check_mqtt(&config.mqtt, linger_secs, shutdown).await
        }
        Command::Stomp => run_stomp(config, shutdown).await,
        Command::Coap(args) => match args.resolve().await {
            Ok(invocation) => run_coap(config, invocation, shutdown).await,
            Err(e) => {
                println!("{}", e);
                println!("{}", cli::coap_usage());
                Ok(USAGE_EXIT_CODE as u8)
            }
        },
    }
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    Ok(())
}

/// `RUST_LOG`, when it names a plain level, wins over the configured level.
fn setup_logging_env(configured: Level) {
    let level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|value| value.parse::<Level>().ok())
        .unwrap_or(configured);

    FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

fn mqtt_table(config: &MqttConfig, profile: MqttProfile) -> TopicTable {
    match profile {
        MqttProfile::Device => TopicTable::device(),
        MqttProfile::Gateway => TopicTable::gateway(
            config.gateway_devices.clone(),
            config.raw_payload.clone().into_bytes(),
        ),
    }
}

async fn run_mqtt(
    config: &MqttConfig,
    profile: Option<MqttProfile>,
    shutdown: CancellationToken,
) -> Result<u8> {
    let profile = profile.unwrap_or(config.profile);
    info!("Starting MQTT publisher with {:?} profile", profile);

    let transport = MqttTransport::new(MqttSettings::from_config(config)?);
    let settings = PublishSettings::new(config.interval(), FailurePolicy::Continue);
    let table = mqtt_table(config, profile);
    run_publisher(Box::new(transport), table, settings, FAILURE_EXIT_CODE, shutdown).await
}

async fn check_mqtt(
    config: &MqttConfig,
    linger_secs: Option<u64>,
    shutdown: CancellationToken,
) -> Result<u8> {
    let linger = Duration::from_secs(linger_secs.unwrap_or(config.linger_secs));
    let mut transport = MqttTransport::new(MqttSettings::from_config(config)?);

    if let Err(e) = transport.connect().await {
        error!("MQTT connect check failed: {}", e);
        return Ok(FAILURE_EXIT_CODE);
    }

    info!("Holding MQTT session for {:?}", linger);
    let mut state = transport.state();
    let lost = tokio::select! {
        _ = tokio::time::sleep(linger) => false,
        _ = shutdown.cancelled() => false,
        _ = state.wait_for(|s| *s != ConnectionState::Connected) => true,
    };

    if lost {
        error!("MQTT session to {} dropped during the check", transport.endpoint());
    }
    transport.disconnect().await?;
    Ok(if lost { FAILURE_EXIT_CODE } else { SUCCESS_EXIT_CODE })
}

async fn run_stomp(config: &AppConfig, shutdown: CancellationToken) -> Result<u8> {
    let stomp = &config.stomp;
    let transport = StompTransport::new(StompSettings::from_config(stomp)?);
    let table = TopicTable::single(stomp.destination.clone(), PayloadKind::Attributes);
    let settings = PublishSettings::new(stomp.interval(), FailurePolicy::Terminate);
    run_publisher(Box::new(transport), table, settings, FAILURE_EXIT_CODE, shutdown).await
}

async fn run_coap(
    config: &AppConfig,
    invocation: CoapInvocation,
    shutdown: CancellationToken,
) -> Result<u8> {
    let CoapInvocation {
        operation,
        endpoint,
        payload,
    } = invocation;
    let path = endpoint.path.clone();
    let mut transport = CoapTransport::new(endpoint, config.coap.timeout());
    let error_code = USAGE_EXIT_CODE as u8;

    if operation == CoapOperation::Put {
        let table = TopicTable::single(path, PayloadKind::Literal(payload.unwrap_or_default()));
        let settings = PublishSettings::new(config.coap.interval(), FailurePolicy::Terminate);
        return run_publisher(Box::new(transport), table, settings, error_code, shutdown).await;
    }

    if let Err(e) = transport.connect().await {
        println!("{}", e);
        return Ok(error_code);
    }

    let result = match operation {
        CoapOperation::Observe => {
            tokio::select! {
                observed = transport.observe(&path, |reply| println!("{}\n", reply)) => observed,
                _ = shutdown.cancelled() => Ok(()),
            }
        }
        CoapOperation::Discover => transport.discover().await.map(|reply| println!("{}", reply)),
        other => transport
            .request(other.method(), &path, payload.unwrap_or_default())
            .await
            .map(|reply| println!("{}", reply)),
    };
    transport.disconnect().await?;

    match result {
        Ok(()) => Ok(SUCCESS_EXIT_CODE),
        Err(e) => {
            println!("{}", e);
            Ok(error_code)
        }
    }
}

/// Connects, then publishes until shutdown or a terminating failure.
/// Both a failed connect and a terminating failure exit with `error_code`.
async fn run_publisher(
    transport: Box<dyn Transport>,
    table: TopicTable,
    settings: PublishSettings,
    error_code: u8,
    shutdown: CancellationToken,
) -> Result<u8> {
    let publishing = match Publisher::create(transport, table, settings).connect().await {
        Ok(publishing) => publishing,
        Err(e) => {
            println!("{}", e);
            return Ok(error_code);
        }
    };

    match publishing.run(None, shutdown).await {
        Ok(terminated) => {
            debug!("Publisher stopped after {} message(s)", terminated.counter());
            Ok(SUCCESS_EXIT_CODE)
        }
        Err(e @ PublisherError::Publish { .. }) => {
            // The failed outcome has already been printed by the loop.
            debug!("{}", e);
            Ok(error_code)
        }
        Err(e) => Err(eyre!("Publisher failed: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::CoapArgs;
    use crate::config::CoapConfig;
    use tokio::net::{TcpListener, UdpSocket};

    fn coap(operation: CoapOperation, path: &str, payload: Option<&str>) -> Command {
        Command::Coap(CoapArgs {
            operation: Some(operation),
            path: Some(path.to_string()),
            payload: payload.map(str::to_string),
            payload_file: None,
        })
    }

    #[tokio::test]
    async fn coap_usage_error_exits_with_usage_code() {
        let command = coap(CoapOperation::Get, "http://h/x", None);
        let status = dispatch(command, &AppConfig::default(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(status, USAGE_EXIT_CODE as u8);
    }

    #[tokio::test]
    async fn coap_put_without_response_exits_with_usage_code() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();
        let config = AppConfig {
            coap: CoapConfig {
                interval_ms: 0,
                timeout_ms: 200,
            },
            ..AppConfig::default()
        };

        let path = format!("coap://127.0.0.1:{}/basic", port);
        let command = coap(CoapOperation::Put, &path, Some("42"));
        let status = dispatch(command, &config, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(status, USAGE_EXIT_CODE as u8);
    }

    #[tokio::test]
    async fn unreachable_stomp_broker_exits_with_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut config = AppConfig::default();
        config.stomp.host = "127.0.0.1".to_string();
        config.stomp.port = port;
        config.stomp.connect_timeout_secs = 2;

        let status = dispatch(Command::Stomp, &config, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(status, FAILURE_EXIT_CODE);
    }

    #[tokio::test]
    async fn cancelled_coap_put_exits_cleanly() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let path = format!("coap://127.0.0.1:{}/basic", port);
        let command = coap(CoapOperation::Put, &path, Some("42"));
        let status = dispatch(command, &AppConfig::default(), shutdown)
            .await
            .unwrap();
        assert_eq!(status, SUCCESS_EXIT_CODE);
    }
}
