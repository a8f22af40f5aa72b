//! Connect/publish subset of MQTT 3.1 (`MQIsdp`, QoS 0, clean session).
//!
//! The client never resolves names itself: the broker host must already be in
//! its [`NameCache`]. It also never retries; a failure leaves the session
//! disconnected with `last_error` set and the caller decides when to try again.

use std::{net::SocketAddrV4, sync::Arc, time::Duration};

use log::{debug, info, warn};
use thiserror::Error;

use crate::{
    net::{Clock, Connector, Stream},
    resolve::NameCache,
};

pub const PACKET_CONNECT: u8 = 0x10;
pub const PACKET_CONNACK: u8 = 0x20;
pub const PACKET_PUBLISH: u8 = 0x30;

pub const PROTOCOL_NAME: &[u8; 6] = b"MQIsdp";
pub const PROTOCOL_LEVEL: u8 = 0x03;
pub const FLAG_CLEAN_SESSION: u8 = 0x02;
pub const KEEP_ALIVE_SECS: u16 = 60;

pub const CONNECT_TIMEOUT_MS: u64 = 5_000;
pub const CONNACK_TIMEOUT_MS: u64 = 5_000;
const CONNACK_SETTLE_MS: u64 = 50;
const CONNACK_POLL_MS: u64 = 10;

/// Largest frame the client will assemble.
pub const MAX_FRAME_LEN: usize = 1024;
/// Two-byte remaining-length ceiling.
pub const MAX_REMAINING_LEN: usize = 16_383;

// Protocol name field, level, flags and keep-alive: everything before the client id.
const CONNECT_VARIABLE_HEADER_LEN: usize = 2 + PROTOCOL_NAME.len() + 1 + 1 + 2;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MqttError {
    #[error("host `{0}` not in name cache")]
    ResolutionFailed(String),
    #[error("tcp connect failed: {0}")]
    TcpFailed(String),
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("not connected")]
    NotConnected,
    #[error("payload too large ({len} bytes, limit {limit})")]
    PayloadTooLarge { len: usize, limit: usize },
    #[error("client id too long ({0} bytes)")]
    ClientIdTooLong(usize),
    #[error("transport error: {0}")]
    Io(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Resolving,
    TcpConnecting,
    HandshakeSent,
    Connected,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageSession {
    pub host: String,
    pub address: Option<SocketAddrV4>,
    pub port: u16,
    pub client_id: String,
    pub connected: bool,
    pub last_error: Option<String>,
}

/// One byte below 128, two bytes below 16384.
pub fn encode_remaining_length(len: usize) -> Result<Vec<u8>, MqttError> {
    match len {
        0..=127 => Ok(vec![len as u8]),
        128..=MAX_REMAINING_LEN => Ok(vec![(len % 128) as u8 | 0x80, (len / 128) as u8]),
        _ => Err(MqttError::PayloadTooLarge {
            len,
            limit: MAX_REMAINING_LEN,
        }),
    }
}

pub fn encode_connect(client_id: &str) -> Result<Vec<u8>, MqttError> {
    let id = client_id.as_bytes();
    let remaining = CONNECT_VARIABLE_HEADER_LEN + 2 + id.len();
    if remaining > 127 {
        return Err(MqttError::ClientIdTooLong(id.len()));
    }

    let mut frame = Vec::with_capacity(2 + remaining);
    frame.push(PACKET_CONNECT);
    frame.push(remaining as u8);
    frame.extend_from_slice(&(PROTOCOL_NAME.len() as u16).to_be_bytes());
    frame.extend_from_slice(PROTOCOL_NAME);
    frame.push(PROTOCOL_LEVEL);
    frame.push(FLAG_CLEAN_SESSION);
    frame.extend_from_slice(&KEEP_ALIVE_SECS.to_be_bytes());
    frame.extend_from_slice(&(id.len() as u16).to_be_bytes());
    frame.extend_from_slice(id);
    Ok(frame)
}

/// QoS 0 PUBLISH: no packet id, payload follows the topic without a length prefix.
pub fn encode_publish(topic: &str, payload: &[u8]) -> Result<Vec<u8>, MqttError> {
    let remaining = 2 + topic.len() + payload.len();
    let length = encode_remaining_length(remaining)?;

    let total = 1 + length.len() + remaining;
    if total > MAX_FRAME_LEN {
        return Err(MqttError::PayloadTooLarge {
            len: total,
            limit: MAX_FRAME_LEN,
        });
    }

    let mut frame = Vec::with_capacity(total);
    frame.push(PACKET_PUBLISH);
    frame.extend_from_slice(&length);
    frame.extend_from_slice(&(topic.len() as u16).to_be_bytes());
    frame.extend_from_slice(topic.as_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Judges whatever arrived before the CONNACK deadline.
///
/// A short reply (1 to 3 bytes) starting with the CONNACK type is accepted
/// without a return code; some brokers flush the tail late.
pub fn interpret_connack(reply: &[u8]) -> Result<(), MqttError> {
    match reply {
        [] => Err(MqttError::HandshakeFailed(format!(
            "no CONNACK within {CONNACK_TIMEOUT_MS}ms"
        ))),
        [PACKET_CONNACK, _, _, 0x00, ..] => Ok(()),
        [PACKET_CONNACK, _, _, code, ..] => Err(MqttError::HandshakeFailed(format!(
            "broker refused connection (return code {code})"
        ))),
        [PACKET_CONNACK, ..] if reply.len() < 4 => {
            warn!("short CONNACK ({} bytes) accepted", reply.len());
            Ok(())
        }
        [other, ..] => Err(MqttError::HandshakeFailed(format!(
            "unexpected packet type {other:#04x}"
        ))),
    }
}

pub struct MessageClient<C: Connector> {
    connector: C,
    clock: Arc<dyn Clock>,
    names: NameCache,
    stream: Option<C::Stream>,
    state: SessionState,
    session: MessageSession,
}

impl<C: Connector> MessageClient<C> {
    pub fn new(connector: C, clock: Arc<dyn Clock>, names: NameCache) -> Self {
        Self {
            connector,
            clock,
            names,
            stream: None,
            state: SessionState::Disconnected,
            session: MessageSession::default(),
        }
    }

    pub fn names(&self) -> &NameCache {
        &self.names
    }

    pub fn names_mut(&mut self) -> &mut NameCache {
        &mut self.names
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session(&self) -> &MessageSession {
        &self.session
    }

    pub fn connect(&mut self, host: &str, port: u16, client_id: &str) -> Result<(), MqttError> {
        self.disconnect();
        self.session = MessageSession {
            host: host.to_string(),
            address: None,
            port,
            client_id: client_id.to_string(),
            connected: false,
            last_error: None,
        };

        self.state = SessionState::Resolving;
        let Some(ip) = self.names.lookup(host) else {
            return Err(self.fail(MqttError::ResolutionFailed(host.to_string())));
        };
        let addr = SocketAddrV4::new(ip, port);
        self.session.address = Some(addr);

        let frame = match encode_connect(client_id) {
            Ok(frame) => frame,
            Err(err) => return Err(self.fail(err)),
        };

        self.state = SessionState::TcpConnecting;
        info!("connecting to broker {host} ({addr})");
        let mut stream = match self
            .connector
            .connect(addr, Duration::from_millis(CONNECT_TIMEOUT_MS))
        {
            Ok(stream) => stream,
            Err(err) => return Err(self.fail(MqttError::TcpFailed(err.to_string()))),
        };

        if let Err(err) = stream.write_all(&frame).and_then(|()| stream.flush()) {
            stream.close();
            return Err(self.fail(MqttError::TcpFailed(err.to_string())));
        }
        self.state = SessionState::HandshakeSent;
        debug!("CONNECT sent ({} bytes), waiting for CONNACK", frame.len());

        let reply = match self.await_connack(&mut stream) {
            Ok(reply) => reply,
            Err(err) => {
                stream.close();
                return Err(self.fail(err));
            }
        };

        if let Err(err) = interpret_connack(&reply) {
            stream.close();
            return Err(self.fail(err));
        }

        self.stream = Some(stream);
        self.state = SessionState::Connected;
        self.session.connected = true;
        info!("broker session established as `{client_id}`");
        Ok(())
    }

    fn await_connack(&self, stream: &mut C::Stream) -> Result<Vec<u8>, MqttError> {
        let start = self.clock.now_ms();
        let io_err = |err: std::io::Error| MqttError::Io(err.to_string());

        while stream.available().map_err(io_err)? == 0 {
            if self.clock.now_ms().saturating_sub(start) >= CONNACK_TIMEOUT_MS {
                return Ok(Vec::new());
            }
            self.clock.sleep_ms(CONNACK_POLL_MS);
        }

        self.clock.sleep_ms(CONNACK_SETTLE_MS);
        let mut reply = [0_u8; 4];
        let read = stream.read(&mut reply).map_err(io_err)?;
        Ok(reply[..read].to_vec())
    }

    pub fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), MqttError> {
        if !self.connected() {
            return Err(MqttError::NotConnected);
        }

        let frame = encode_publish(topic, payload)?;
        let Some(stream) = self.stream.as_mut() else {
            return Err(MqttError::NotConnected);
        };

        match stream.write_all(&frame).and_then(|()| stream.flush()) {
            Ok(()) => {
                debug!("published {} bytes to `{topic}`", payload.len());
                Ok(())
            }
            Err(err) => {
                stream.close();
                self.stream = None;
                Err(self.fail(MqttError::Io(err.to_string())))
            }
        }
    }

    /// Session flag combined with the transport's own view.
    pub fn connected(&mut self) -> bool {
        let alive = self
            .stream
            .as_mut()
            .is_some_and(|stream| stream.is_connected());

        if self.state == SessionState::Connected && !alive {
            warn!("broker connection dropped");
            self.stream = None;
            self.state = SessionState::Disconnected;
            self.session.connected = false;
        }
        self.state == SessionState::Connected
    }

    pub fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.close();
            info!("broker session closed");
        }
        self.state = SessionState::Disconnected;
        self.session.connected = false;
    }

    fn fail(&mut self, err: MqttError) -> MqttError {
        warn!("broker session error: {err}");
        self.state = SessionState::Disconnected;
        self.session.connected = false;
        self.session.last_error = Some(err.to_string());
        err
    }
}
