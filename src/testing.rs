//! Test doubles shared by the unit tests

use crate::mqtt::{ConnectionState, PublishError, Publisher};
use rumqttc::QoS;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// In-memory publisher recording everything it is asked to send
#[derive(Default)]
pub struct FakePublisher {
    pub disconnected: AtomicBool,
    pub reject: AtomicBool,
    pub published: Mutex<Vec<(String, Vec<u8>)>>,
}

impl FakePublisher {
    pub fn set_connected(&self, connected: bool) {
        self.disconnected.store(!connected, Ordering::SeqCst);
    }

    pub fn set_rejecting(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().unwrap().clone()
    }
}

impl Publisher for FakePublisher {
    fn connection_state(&self) -> ConnectionState {
        if self.disconnected.load(Ordering::SeqCst) {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Connected
        }
    }

    fn publish(&self, topic: &str, payload: Vec<u8>, _qos: QoS) -> Result<(), PublishError> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(PublishError::Rejected("request queue full".into()));
        }
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload));
        Ok(())
    }
}

/// Loopback MQTT 3.1.1 broker that speaks just enough of the protocol for
/// connection tests
pub struct FakeBroker {
    listener: TcpListener,
}

impl FakeBroker {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self { listener }
    }

    pub fn port(&self) -> u16 {
        self.listener.local_addr().unwrap().port()
    }

    /// Accepts the next client and answers its CONNECT with a CONNACK
    pub async fn accept(&self) -> BrokerSession {
        let (stream, _) = self.listener.accept().await.unwrap();
        let mut session = BrokerSession { stream };
        let (header, _) = session.read_packet().await.unwrap();
        assert_eq!(header >> 4, 1, "expected CONNECT, got {:#04x}", header);
        session.stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();
        session
    }
}

pub struct BrokerSession {
    stream: TcpStream,
}

impl BrokerSession {
    async fn read_packet(&mut self) -> std::io::Result<(u8, Vec<u8>)> {
        let header = self.stream.read_u8().await?;
        let mut length = 0usize;
        let mut shift = 0;
        loop {
            let byte = self.stream.read_u8().await?;
            length |= usize::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; length];
        self.stream.read_exact(&mut body).await?;
        Ok((header, body))
    }

    /// Answers PINGREQ and SUBSCRIBE; returns the filters of a SUBSCRIBE
    async fn answer(&mut self, header: u8, body: &[u8]) -> Vec<String> {
        match header >> 4 {
            8 => {
                let mut filters = Vec::new();
                let mut at = 2;
                while at + 2 <= body.len() {
                    let len = usize::from(u16::from_be_bytes([body[at], body[at + 1]]));
                    at += 2;
                    filters.push(String::from_utf8_lossy(&body[at..at + len]).into_owned());
                    at += len + 1;
                }
                let mut suback = vec![0x90, 2 + filters.len() as u8, body[0], body[1]];
                suback.extend(std::iter::repeat(0x00).take(filters.len()));
                self.stream.write_all(&suback).await.unwrap();
                filters
            }
            12 => {
                self.stream.write_all(&[0xd0, 0x00]).await.unwrap();
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    /// Reads until `count` topic filters were subscribed
    pub async fn expect_subscriptions(&mut self, count: usize) -> Vec<String> {
        let mut filters = Vec::new();
        while filters.len() < count {
            let (header, body) = self.read_packet().await.unwrap();
            filters.extend(self.answer(header, &body).await);
        }
        filters
    }

    /// Sends a QoS 0 PUBLISH
    pub async fn publish(&mut self, topic: &str, payload: &[u8]) {
        let mut body = Vec::with_capacity(2 + topic.len() + payload.len());
        body.extend_from_slice(&(topic.len() as u16).to_be_bytes());
        body.extend_from_slice(topic.as_bytes());
        body.extend_from_slice(payload);

        let mut packet = vec![0x30];
        let mut length = body.len();
        loop {
            let mut byte = (length % 128) as u8;
            length /= 128;
            if length > 0 {
                byte |= 0x80;
            }
            packet.push(byte);
            if length == 0 {
                break;
            }
        }
        packet.extend_from_slice(&body);
        self.stream.write_all(&packet).await.unwrap();
    }

    /// Serves the client until it disconnects
    pub async fn serve(mut self) {
        while let Ok((header, body)) = self.read_packet().await {
            if header >> 4 == 14 {
                break;
            }
            self.answer(header, &body).await;
        }
    }
}
