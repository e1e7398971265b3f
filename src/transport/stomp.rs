//! STOMP transport on top of async-stomp.
//!
//! async-stomp owns the framing and the CONNECT/CONNECTED handshake. After the
//! handshake the connection moves into a session task, the same way the MQTT
//! event loop gets its own driver. The task prints whatever the broker pushes
//! back and takes outgoing frames from the transport over a channel.

use std::time::Duration;

use async_stomp::client::{Connector, Subscriber};
use async_stomp::{FromServer, Message, ToServer};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Delivery, Protocol, Transport, TransportError};
use crate::config::{Credentials, StompConfig};
use crate::publisher::payload::Payload;

const SUBSCRIPTION_ID: &str = "1";
const DISCONNECT_RECEIPT: &str = "iotpub-disconnect";
const SESSION_GRACE: Duration = Duration::from_secs(1);
const COMMAND_CHANNEL_CAPACITY: usize = 16;

#[derive(Clone, Debug)]
pub struct StompSettings {
    pub host: String,
    pub port: u16,
    pub credentials: Option<Credentials>,
    pub destination: String,
    pub subscribe: bool,
    pub connect_timeout: Duration,
}

impl StompSettings {
    pub fn from_config(config: &StompConfig) -> Result<Self, TransportError> {
        let credentials = config
            .credentials()
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        Ok(Self {
            host: config.host.clone(),
            port: config.port,
            credentials,
            destination: config.destination.clone(),
            subscribe: config.subscribe,
            connect_timeout: config.connect_timeout(),
        })
    }
}

/// Requests handed from the transport to the session task
enum SessionCommand {
    Send(Message<ToServer>, oneshot::Sender<Result<(), String>>),
    Disconnect(oneshot::Sender<Result<(), String>>),
}

pub struct StompTransport {
    settings: StompSettings,
    commands: Option<mpsc::Sender<SessionCommand>>,
    session: Option<JoinHandle<()>>,
}

impl StompTransport {
    pub fn new(settings: StompSettings) -> Self {
        Self {
            settings,
            commands: None,
            session: None,
        }
    }

    async fn request(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<(), String>>) -> SessionCommand,
    ) -> Result<(), TransportError> {
        let commands = self.commands.as_ref().ok_or(TransportError::NotConnected)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        commands
            .send(build(reply_tx))
            .await
            .map_err(|_| TransportError::NotConnected)?;
        reply_rx
            .await
            .map_err(|_| TransportError::NotConnected)?
            .map_err(TransportError::Publish)
    }
}

#[async_trait]
impl Transport for StompTransport {
    fn protocol(&self) -> Protocol {
        Protocol::Stomp
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.settings.host, self.settings.port)
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        println!("connecting {} {}", self.settings.host, self.settings.port);
        let server = self.endpoint();
        let virtualhost = self.settings.host.clone();

        let connecting = async {
            match &self.settings.credentials {
                Some(credentials) => {
                    Connector::builder()
                        .server(server.clone())
                        .virtualhost(virtualhost.clone())
                        .login(credentials.username.clone())
                        .passcode(credentials.password.clone())
                        .connect()
                        .await
                }
                None => {
                    Connector::builder()
                        .server(server.clone())
                        .virtualhost(virtualhost.clone())
                        .connect()
                        .await
                }
            }
        };

        let mut connection = tokio::time::timeout(self.settings.connect_timeout, connecting)
            .await
            .map_err(|_| TransportError::Timeout(format!("CONNECTED frame from {}", server)))?
            .map_err(|e| TransportError::Connect {
                endpoint: server.clone(),
                reason: e.to_string(),
            })?;
        debug!("STOMP session established with {}", server);

        if self.settings.subscribe {
            let subscribe = Subscriber::builder()
                .destination(self.settings.destination.clone())
                .id(SUBSCRIPTION_ID.to_string())
                .subscribe();
            connection
                .send(subscribe)
                .await
                .map_err(|e| TransportError::Protocol(e.to_string()))?;
            info!("Subscribed to {}", self.settings.destination);
        }

        let (commands_tx, mut commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        self.commands = Some(commands_tx);
        self.session = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    command = commands_rx.recv() => match command {
                        Some(SessionCommand::Send(message, reply)) => {
                            let sent = connection.send(message).await.map_err(|e| e.to_string());
                            reply.send(sent).ok();
                        }
                        Some(SessionCommand::Disconnect(reply)) => {
                            let disconnect = ToServer::Disconnect {
                                receipt: Some(DISCONNECT_RECEIPT.to_string()),
                            };
                            let sent = connection
                                .send(disconnect.into())
                                .await
                                .map_err(|e| e.to_string());
                            reply.send(sent).ok();
                            await_receipt(&mut connection).await;
                            connection.close().await.ok();
                            break;
                        }
                        None => break,
                    },
                    frame = connection.next() => match frame {
                        Some(Ok(message)) => print_frame(message.content),
                        Some(Err(e)) => {
                            warn!("STOMP read failed: {}", e);
                            break;
                        }
                        None => {
                            info!("STOMP connection closed by broker");
                            break;
                        }
                    },
                }
            }
            info!("STOMP session stopped");
        }));
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &Payload,
    ) -> Result<Delivery, TransportError> {
        let send = ToServer::Send {
            destination: topic.to_string(),
            transaction: None,
            headers: Some(vec![(
                "content-type".to_string(),
                payload.content_type().to_string(),
            )]),
            body: Some(payload.to_bytes()?),
        };
        debug!("SEND to {}", topic);
        self.request(|reply| SessionCommand::Send(send.into(), reply))
            .await?;
        Ok(Delivery::accepted())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let result = match self.commands.is_some() {
            true => self.request(SessionCommand::Disconnect).await,
            false => Ok(()),
        };
        self.commands = None;

        if let Some(mut session) = self.session.take() {
            if tokio::time::timeout(SESSION_GRACE * 2, &mut session)
                .await
                .is_err()
            {
                session.abort();
            }
        }

        info!("STOMP session to {} closed", self.endpoint());
        result
    }
}

/// Reads until the broker confirms the DISCONNECT or the grace period ends.
async fn await_receipt<S, E>(connection: &mut S)
where
    S: futures::Stream<Item = Result<Message<FromServer>, E>> + Unpin,
    E: std::fmt::Display,
{
    let waiting = async {
        while let Some(Ok(message)) = connection.next().await {
            match message.content {
                FromServer::Receipt { receipt_id, .. } if receipt_id == DISCONNECT_RECEIPT => {
                    debug!("DISCONNECT receipt received");
                    return;
                }
                other => print_frame(other),
            }
        }
    };
    if tokio::time::timeout(SESSION_GRACE, waiting).await.is_err() {
        debug!("No DISCONNECT receipt within {:?}", SESSION_GRACE);
    }
}

fn print_frame(frame: FromServer) {
    match frame {
        FromServer::Message {
            destination, body, ..
        } => println!(
            "received a message {}: {}",
            destination,
            String::from_utf8_lossy(body.as_deref().unwrap_or_default())
        ),
        FromServer::Error { message, body, .. } => println!(
            "received an error {}: {}",
            message.unwrap_or_default(),
            String::from_utf8_lossy(body.as_deref().unwrap_or_default())
        ),
        FromServer::Receipt { receipt_id, .. } => debug!("receipt {}", receipt_id),
        _ => debug!("Ignoring frame from broker"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};

    fn settings(port: u16) -> StompSettings {
        StompSettings {
            host: "127.0.0.1".to_string(),
            port,
            credentials: Some(Credentials {
                username: "jesse".to_string(),
                password: "123456".to_string(),
            }),
            destination: "/queue/test".to_string(),
            subscribe: true,
            connect_timeout: Duration::from_secs(5),
        }
    }

    /// Next NUL-terminated frame as text, skipping heart-beat EOLs.
    async fn read_frame(reader: &mut BufReader<TcpStream>) -> Option<String> {
        loop {
            let mut raw = Vec::new();
            if reader.read_until(0, &mut raw).await.ok()? == 0 {
                return None;
            }
            let text = String::from_utf8_lossy(&raw)
                .trim_start_matches(['\r', '\n'])
                .trim_end_matches('\0')
                .to_string();
            if !text.is_empty() {
                return Some(text);
            }
        }
    }

    fn command(frame: &str) -> &str {
        frame.lines().next().unwrap_or_default()
    }

    /// Accepts one connection, answers the handshake with `reply` and returns
    /// every frame received until the client hangs up.
    async fn fake_broker(reply: &'static str) -> (u16, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(socket);
            let mut frames = Vec::new();
            if let Some(connect) = read_frame(&mut reader).await {
                frames.push(connect);
                reader.get_mut().write_all(reply.as_bytes()).await.unwrap();
            }
            while let Some(frame) = read_frame(&mut reader).await {
                let receipt = frame
                    .lines()
                    .find_map(|line| line.strip_prefix("receipt:"))
                    .map(str::to_string);
                frames.push(frame);
                if let Some(id) = receipt {
                    let answer = format!("RECEIPT\nreceipt-id:{}\n\n\0", id);
                    reader.get_mut().write_all(answer.as_bytes()).await.ok();
                }
            }
            frames
        });
        (port, handle)
    }

    #[tokio::test]
    async fn session_sends_connect_subscribe_send_disconnect() {
        let (port, broker) = fake_broker("CONNECTED\nversion:1.2\n\n\0").await;
        let mut transport = StompTransport::new(settings(port));

        transport.connect().await.unwrap();
        let payload = Payload::Raw(b"hello".to_vec());
        transport.publish("/queue/test", &payload).await.unwrap();
        transport.disconnect().await.unwrap();

        let frames = broker.await.unwrap();
        let commands: Vec<&str> = frames.iter().map(|f| command(f)).collect();
        assert!(matches!(commands[0], "CONNECT" | "STOMP"), "{commands:?}");
        assert_eq!(&commands[1..], ["SUBSCRIBE", "SEND", "DISCONNECT"]);
        assert!(frames[0].contains("login:jesse"));
        assert!(frames[0].contains("passcode:123456"));
        assert!(frames[1].contains("destination:/queue/test"));
        assert!(frames[2].contains("destination:/queue/test"));
        assert!(frames[2].contains("content-type:application/octet-stream"));
        assert!(frames[2].ends_with("hello"));
    }

    #[tokio::test]
    async fn error_frame_fails_connect() {
        let (port, _broker) = fake_broker("ERROR\nmessage:Bad CONNECT\n\n\0").await;
        let mut transport = StompTransport::new(settings(port));

        let err = transport.connect().await.unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }), "{err}");
    }

    #[tokio::test]
    async fn publish_requires_connection() {
        let mut transport = StompTransport::new(settings(1));
        let err = transport
            .publish("/queue/test", &Payload::Raw(Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }

    #[tokio::test]
    async fn closed_port_fails_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut transport = StompTransport::new(settings(port));
        let err = transport.connect().await.unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }), "{err}");
    }
}
