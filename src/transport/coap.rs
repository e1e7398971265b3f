//! CoAP client transport.
//!
//! Packets are built and parsed with `coap-lite`; this module only moves them
//! over a connected UDP socket and matches replies to requests. Requests are
//! confirmable. A reply matches on message id (piggy-backed ACK) or on token
//! (separate response, which gets an empty ACK back). Datagrams that do not
//! decode as CoAP are dropped and the wait goes on.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use coap_lite::{CoapRequest, MessageClass, MessageType, ObserveOption, Packet, RequestType};
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::{Delivery, Protocol, Transport, TransportError};
use crate::publisher::payload::Payload;

pub const DEFAULT_PORT: u16 = 5683;
const DISCOVERY_PATH: &str = ".well-known/core";
const MAX_DATAGRAM: usize = 1500;
const TOKEN_LEN: usize = 4;

/// `coap://host[:port]/path` split into its parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapEndpoint {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl CoapEndpoint {
    pub fn parse(uri: &str) -> Result<Self, TransportError> {
        let rest = uri
            .strip_prefix("coap://")
            .ok_or_else(|| TransportError::Protocol(format!("'{}' is not a coap:// URI", uri)))?;

        let (authority, path) = match rest.find('/') {
            Some(index) => (&rest[..index], &rest[index + 1..]),
            None => (rest, ""),
        };

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, tail) = bracketed.split_once(']').ok_or_else(|| {
                TransportError::Protocol(format!("unterminated IPv6 literal in '{}'", uri))
            })?;
            (host, tail.strip_prefix(':'))
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };

        if host.is_empty() {
            return Err(TransportError::Protocol(format!("missing host in '{}'", uri)));
        }

        let port = match port {
            Some(port) => port
                .parse()
                .map_err(|_| TransportError::Protocol(format!("invalid port '{}'", port)))?,
            None => DEFAULT_PORT,
        };

        Ok(Self {
            host: host.to_string(),
            port,
            path: path.to_string(),
        })
    }
}

impl fmt::Display for CoapEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "coap://[{}]:{}/{}", self.host, self.port, self.path)
        } else {
            write!(f, "coap://{}:{}/{}", self.host, self.port, self.path)
        }
    }
}

/// Request methods the client can issue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoapMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl From<CoapMethod> for RequestType {
    fn from(method: CoapMethod) -> Self {
        match method {
            CoapMethod::Get => RequestType::Get,
            CoapMethod::Post => RequestType::Post,
            CoapMethod::Put => RequestType::Put,
            CoapMethod::Delete => RequestType::Delete,
        }
    }
}

/// Decoded response packet
#[derive(Debug, Clone)]
pub struct CoapReply {
    pub source: String,
    pub message_type: MessageType,
    pub message_id: u16,
    pub code: MessageClass,
    pub token: Vec<u8>,
    pub payload: Vec<u8>,
}

impl CoapReply {
    fn from_packet(packet: &Packet, source: &str) -> Self {
        Self {
            source: source.to_string(),
            message_type: packet.header.get_type(),
            message_id: packet.header.message_id,
            code: packet.header.code,
            token: packet.get_token().to_vec(),
            payload: packet.payload.clone(),
        }
    }
}

impl fmt::Display for CoapReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Source: {}", self.source)?;
        writeln!(f, "Type: {:?}", self.message_type)?;
        writeln!(f, "MID: {}", self.message_id)?;
        writeln!(f, "Code: {:?}", self.code)?;
        let token: String = self.token.iter().map(|b| format!("{:02x}", b)).collect();
        writeln!(f, "Token: {}", token)?;
        write!(f, "Payload: {}", String::from_utf8_lossy(&self.payload))
    }
}

pub struct CoapTransport {
    endpoint: CoapEndpoint,
    timeout: Duration,
    socket: Option<UdpSocket>,
    peer: String,
    next_message_id: u16,
    next_token: u32,
}

impl CoapTransport {
    pub fn new(endpoint: CoapEndpoint, timeout: Duration) -> Self {
        let seed = chrono::Utc::now().timestamp_subsec_nanos();
        Self {
            peer: format!("{}:{}", endpoint.host, endpoint.port),
            endpoint,
            timeout,
            socket: None,
            next_message_id: (seed & 0xffff) as u16,
            next_token: seed.rotate_left(16),
        }
    }

    fn message_id(&mut self) -> u16 {
        self.next_message_id = self.next_message_id.wrapping_add(1);
        self.next_message_id
    }

    fn token(&mut self) -> Vec<u8> {
        self.next_token = self.next_token.wrapping_add(1);
        self.next_token.to_be_bytes()[..TOKEN_LEN].to_vec()
    }

    fn build_request(
        &mut self,
        method: CoapMethod,
        path: &str,
        payload: Vec<u8>,
        observe: bool,
    ) -> Packet {
        let mut request: CoapRequest<SocketAddr> = CoapRequest::new();
        request.set_method(method.into());
        request.set_path(path.trim_start_matches('/'));
        if observe {
            request.set_observe_flag(ObserveOption::Register);
        }
        request.message.header.set_type(MessageType::Confirmable);
        request.message.header.message_id = self.message_id();
        request.message.set_token(self.token());
        request.message.payload = payload;
        request.message
    }

    async fn send_packet(&self, packet: &Packet) -> Result<(), TransportError> {
        let socket = self.socket.as_ref().ok_or(TransportError::NotConnected)?;
        let bytes = packet
            .to_bytes()
            .map_err(|e| TransportError::Protocol(format!("cannot encode packet: {:?}", e)))?;
        socket.send(&bytes).await?;
        Ok(())
    }

    /// Next datagram from the peer, `None` when it is not a CoAP packet.
    async fn receive(&self) -> Result<Option<Packet>, TransportError> {
        let socket = self.socket.as_ref().ok_or(TransportError::NotConnected)?;
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let len = socket.recv(&mut buf).await?;
        match Packet::from_bytes(&buf[..len]) {
            Ok(packet) => Ok(Some(packet)),
            Err(e) => {
                warn!("Dropping undecodable {} byte datagram from {}: {:?}", len, self.peer, e);
                Ok(None)
            }
        }
    }

    async fn acknowledge(&self, message_id: u16) -> Result<(), TransportError> {
        let mut ack = Packet::new();
        ack.header.set_type(MessageType::Acknowledgement);
        ack.header.message_id = message_id;
        ack.header.code = MessageClass::Empty;
        self.send_packet(&ack).await
    }

    /// Sends `request` and waits for the matching response.
    async fn exchange(&mut self, request: Packet) -> Result<CoapReply, TransportError> {
        let message_id = request.header.message_id;
        let token = request.get_token().to_vec();
        self.send_packet(&request).await?;

        let deadline = Instant::now() + self.timeout;
        loop {
            let received = tokio::time::timeout_at(deadline, self.receive())
                .await
                .map_err(|_| TransportError::Timeout(format!("response from {}", self.peer)))??;
            let Some(packet) = received else {
                continue;
            };

            let message_type = packet.header.get_type();
            let same_exchange = packet.header.message_id == message_id;

            if same_exchange && message_type == MessageType::Reset {
                return Err(TransportError::Rejected(format!(
                    "{} reset message {}",
                    self.peer, message_id
                )));
            }

            if same_exchange
                && message_type == MessageType::Acknowledgement
                && packet.header.code == MessageClass::Empty
            {
                debug!("Empty ACK for {}, waiting for separate response", message_id);
                continue;
            }

            if packet.get_token().to_vec() == token {
                if message_type == MessageType::Confirmable {
                    self.acknowledge(packet.header.message_id).await?;
                }
                return Ok(CoapReply::from_packet(&packet, &self.peer));
            }

            trace!("Ignoring unrelated packet {}", packet.header.message_id);
        }
    }

    /// Issues a single request and returns the response.
    pub async fn request(
        &mut self,
        method: CoapMethod,
        path: &str,
        payload: Vec<u8>,
    ) -> Result<CoapReply, TransportError> {
        let packet = self.build_request(method, path, payload, false);
        self.exchange(packet).await
    }

    /// GET on the resource discovery path
    pub async fn discover(&mut self) -> Result<CoapReply, TransportError> {
        self.request(CoapMethod::Get, DISCOVERY_PATH, Vec::new())
            .await
    }

    /// Registers as observer of `path` and hands every notification to
    /// `on_notification` until the socket fails.
    pub async fn observe<F>(&mut self, path: &str, mut on_notification: F) -> Result<(), TransportError>
    where
        F: FnMut(&CoapReply) + Send,
    {
        let request = self.build_request(CoapMethod::Get, path, Vec::new(), true);
        let token = request.get_token().to_vec();
        let first = self.exchange(request).await?;
        on_notification(&first);
        info!("Observing {} on {}", path, self.peer);

        loop {
            let Some(packet) = self.receive().await? else {
                continue;
            };
            if packet.get_token().to_vec() != token {
                trace!("Ignoring packet for another token");
                continue;
            }
            if packet.header.get_type() == MessageType::Confirmable {
                self.acknowledge(packet.header.message_id).await?;
            }
            on_notification(&CoapReply::from_packet(&packet, &self.peer));
        }
    }
}

#[async_trait]
impl Transport for CoapTransport {
    fn protocol(&self) -> Protocol {
        Protocol::Coap
    }

    fn endpoint(&self) -> String {
        self.peer.clone()
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        let host = self.endpoint.host.as_str();
        let port = self.endpoint.port;

        // Resolution failures fall through to the literal host.
        let resolved = match lookup_host((host, port)).await {
            Ok(mut addrs) => addrs.next(),
            Err(e) => {
                debug!("Could not resolve {}: {}", host, e);
                None
            }
        };

        let bind_addr = match resolved {
            Some(SocketAddr::V6(_)) => "[::]:0",
            _ => "0.0.0.0:0",
        };
        let socket = UdpSocket::bind(bind_addr).await?;

        let connected = match resolved {
            Some(addr) => socket.connect(addr).await,
            None => socket.connect((host, port)).await,
        };
        connected.map_err(|e| TransportError::Connect {
            endpoint: self.peer.clone(),
            reason: e.to_string(),
        })?;

        if let Some(addr) = resolved {
            self.peer = addr.to_string();
        }
        debug!("CoAP socket {:?} -> {}", socket.local_addr().ok(), self.peer);
        self.socket = Some(socket);
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &Payload,
    ) -> Result<Delivery, TransportError> {
        let reply = self
            .request(CoapMethod::Put, topic, payload.to_bytes()?)
            .await?;
        Ok(Delivery::with_response(reply.to_string()))
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        if self.socket.take().is_some() {
            info!("CoAP client for {} stopped", self.peer);
        } else {
            warn!("CoAP client for {} was not running", self.peer);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coap_lite::ResponseType;

    #[test]
    fn parses_host_port_and_path() {
        let endpoint = CoapEndpoint::parse("coap://192.168.123.9:31683/sensors/temp").unwrap();
        assert_eq!(endpoint.host, "192.168.123.9");
        assert_eq!(endpoint.port, 31683);
        assert_eq!(endpoint.path, "sensors/temp");
    }

    #[test]
    fn default_port_and_empty_path() {
        let endpoint = CoapEndpoint::parse("coap://gateway.local").unwrap();
        assert_eq!(endpoint.port, DEFAULT_PORT);
        assert_eq!(endpoint.path, "");
    }

    #[test]
    fn ipv6_literal() {
        let endpoint = CoapEndpoint::parse("coap://[::1]:5684/a").unwrap();
        assert_eq!(endpoint.host, "::1");
        assert_eq!(endpoint.port, 5684);
        assert_eq!(endpoint.to_string(), "coap://[::1]:5684/a");
    }

    #[test]
    fn rejects_other_schemes_and_bad_ports() {
        assert!(CoapEndpoint::parse("http://host/path").is_err());
        assert!(CoapEndpoint::parse("coap://host:port/path").is_err());
        assert!(CoapEndpoint::parse("coap:///path").is_err());
    }

    #[test]
    fn put_request_is_confirmable_with_path_and_payload() {
        let endpoint = CoapEndpoint::parse("coap://127.0.0.1/basic").unwrap();
        let mut transport = CoapTransport::new(endpoint, Duration::from_secs(1));
        let packet = transport.build_request(CoapMethod::Put, "/basic", b"42".to_vec(), false);

        assert_eq!(packet.header.get_type(), MessageType::Confirmable);
        assert_eq!(packet.header.code, MessageClass::Request(RequestType::Put));
        assert_eq!(packet.payload, b"42");
        assert_eq!(packet.get_token().len(), TOKEN_LEN);

        let next = transport.build_request(CoapMethod::Put, "/basic", Vec::new(), false);
        assert_eq!(
            next.header.message_id,
            packet.header.message_id.wrapping_add(1)
        );
        assert_ne!(next.get_token().to_vec(), packet.get_token().to_vec());
    }

    /// Answers one request with a piggy-backed ACK carrying `payload`, sending
    /// `noise` as a separate datagram first when it is not empty.
    async fn fake_server(
        noise: &'static [u8],
        payload: &'static [u8],
    ) -> (u16, tokio::task::JoinHandle<Packet>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            let (len, from) = socket.recv_from(&mut buf).await.unwrap();
            let request = Packet::from_bytes(&buf[..len]).unwrap();
            if !noise.is_empty() {
                socket.send_to(noise, from).await.unwrap();
            }

            let mut response = Packet::new();
            response.header.set_type(MessageType::Acknowledgement);
            response.header.message_id = request.header.message_id;
            response.header.code = MessageClass::Response(ResponseType::Changed);
            response.set_token(request.get_token().to_vec());
            response.payload = payload.to_vec();
            socket
                .send_to(&response.to_bytes().unwrap(), from)
                .await
                .unwrap();
            request
        });
        (port, handle)
    }

    #[tokio::test]
    async fn publish_puts_payload_and_renders_reply() {
        let (port, server) = fake_server(b"", b"stored").await;
        let endpoint = CoapEndpoint::parse(&format!("coap://127.0.0.1:{}/basic", port)).unwrap();
        let mut transport = CoapTransport::new(endpoint, Duration::from_secs(2));

        transport.connect().await.unwrap();
        let delivery = transport
            .publish("basic", &Payload::Raw(b"hello".to_vec()))
            .await
            .unwrap();

        let request = server.await.unwrap();
        assert_eq!(request.header.code, MessageClass::Request(RequestType::Put));
        assert_eq!(request.payload, b"hello");

        let response = delivery.response.unwrap();
        assert!(response.contains("Type: Acknowledgement"));
        assert!(response.contains("Payload: stored"));
    }

    #[tokio::test]
    async fn undecodable_datagram_is_skipped() {
        let (port, server) = fake_server(&[0xff], b"ok").await;
        let endpoint = CoapEndpoint::parse(&format!("coap://127.0.0.1:{}/basic", port)).unwrap();
        let mut transport = CoapTransport::new(endpoint, Duration::from_secs(2));

        transport.connect().await.unwrap();
        let reply = transport
            .request(CoapMethod::Get, "basic", Vec::new())
            .await
            .unwrap();

        server.await.unwrap();
        assert_eq!(reply.payload, b"ok");
        assert_eq!(reply.message_type, MessageType::Acknowledgement);
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();
        let endpoint = CoapEndpoint::parse(&format!("coap://127.0.0.1:{}/x", port)).unwrap();
        let mut transport = CoapTransport::new(endpoint, Duration::from_millis(200));

        transport.connect().await.unwrap();
        let err = transport
            .request(CoapMethod::Get, "x", Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
    }

    #[tokio::test]
    async fn request_before_connect_fails() {
        let endpoint = CoapEndpoint::parse("coap://127.0.0.1/x").unwrap();
        let mut transport = CoapTransport::new(endpoint, Duration::from_millis(200));
        let err = transport.discover().await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }
}
