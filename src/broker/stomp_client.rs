//! STOMP 1.1 adapter over TCP. This is the one place in the crate that
//! speaks broker wire protocol; everything else only sees the
//! [`super::BrokerClient`] trait. Frame encoding here is intentionally
//! minimal — just the handful of STOMP commands the dispatcher needs
//! (CONNECT, SUBSCRIBE, SEND, ACK, NACK, DISCONNECT, and receiving
//! MESSAGE) — rather than a general-purpose STOMP library.

use super::{BrokerClient, Frame, PREFETCH_SIZE};
use crate::error::AgentError;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use url::Url;

pub struct StompBroker {
    url: Url,
    user: String,
    password: String,
    conn: Option<Connection>,
}

struct Connection {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl StompBroker {
    pub fn new(url: Url, user: String, password: String) -> Self {
        Self {
            url,
            user,
            password,
            conn: None,
        }
    }

    fn conn_mut(&mut self) -> Result<&mut Connection, AgentError> {
        self.conn
            .as_mut()
            .ok_or_else(|| AgentError::BrokerDisconnected("not connected".to_string()))
    }

    async fn write_frame(&mut self, frame: &RawFrame) -> Result<(), AgentError> {
        let encoded = frame.encode();
        let conn = self.conn_mut()?;
        conn.writer
            .write_all(&encoded)
            .await
            .map_err(|e| AgentError::BrokerDisconnected(e.to_string()))?;
        conn.writer
            .flush()
            .await
            .map_err(|e| AgentError::BrokerDisconnected(e.to_string()))
    }

    async fn read_frame(&mut self) -> Result<RawFrame, AgentError> {
        let conn = self.conn_mut()?;
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            let n = conn
                .reader
                .read(&mut byte)
                .await
                .map_err(|e| AgentError::BrokerDisconnected(e.to_string()))?;
            if n == 0 {
                return Err(AgentError::BrokerDisconnected("connection closed".to_string()));
            }
            if byte[0] == 0 {
                break;
            }
            buf.push(byte[0]);
        }
        RawFrame::parse(&buf)
            .ok_or_else(|| AgentError::BrokerDisconnected("malformed STOMP frame".to_string()))
    }
}

#[async_trait]
impl BrokerClient for StompBroker {
    async fn connect(&mut self) -> Result<(), AgentError> {
        let host = self
            .url
            .host_str()
            .ok_or_else(|| AgentError::BrokerConnect("broker URL has no host".to_string()))?;
        let port = self.url.port().unwrap_or(61613);

        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| AgentError::BrokerConnect(e.to_string()))?;
        let (read_half, write_half) = stream.into_split();
        self.conn = Some(Connection {
            reader: BufReader::new(read_half),
            writer: write_half,
        });

        let mut headers = HashMap::new();
        headers.insert("accept-version".to_string(), "1.1".to_string());
        headers.insert("host".to_string(), host.to_string());
        headers.insert("login".to_string(), self.user.clone());
        headers.insert("passcode".to_string(), self.password.clone());

        self.write_frame(&RawFrame {
            command: "CONNECT".to_string(),
            headers,
            body: Vec::new(),
        })
        .await?;

        let reply = self.read_frame().await?;
        if reply.command != "CONNECTED" {
            return Err(AgentError::BrokerConnect(format!(
                "unexpected reply to CONNECT: {}",
                reply.command
            )));
        }
        Ok(())
    }

    async fn subscribe(&mut self, destination: &str, subscription_id: &str) -> Result<(), AgentError> {
        let mut headers = HashMap::new();
        headers.insert("id".to_string(), subscription_id.to_string());
        headers.insert("destination".to_string(), destination.to_string());
        headers.insert("ack".to_string(), "client-individual".to_string());
        headers.insert("activemq.prefetchSize".to_string(), PREFETCH_SIZE.to_string());
        self.write_frame(&RawFrame {
            command: "SUBSCRIBE".to_string(),
            headers,
            body: Vec::new(),
        })
        .await
    }

    async fn recv(&mut self) -> Result<Frame, AgentError> {
        loop {
            let raw = self.read_frame().await?;
            if raw.command != "MESSAGE" {
                continue;
            }
            let destination = raw.headers.get("destination").cloned().unwrap_or_default();
            let message_id = raw.headers.get("message-id").cloned().unwrap_or_default();
            let subscription_id = raw.headers.get("subscription").cloned().unwrap_or_default();
            return Ok(Frame {
                destination,
                body: raw.body,
                message_id,
                subscription_id,
            });
        }
    }

    async fn ack(&mut self, frame: &Frame) -> Result<(), AgentError> {
        let mut headers = HashMap::new();
        headers.insert("id".to_string(), frame.message_id.clone());
        headers.insert("subscription".to_string(), frame.subscription_id.clone());
        self.write_frame(&RawFrame {
            command: "ACK".to_string(),
            headers,
            body: Vec::new(),
        })
        .await
    }

    async fn nack(&mut self, frame: &Frame) -> Result<(), AgentError> {
        let mut headers = HashMap::new();
        headers.insert("id".to_string(), frame.message_id.clone());
        headers.insert("subscription".to_string(), frame.subscription_id.clone());
        self.write_frame(&RawFrame {
            command: "NACK".to_string(),
            headers,
            body: Vec::new(),
        })
        .await
    }

    async fn send(&mut self, destination: &str, body: &[u8]) -> Result<(), AgentError> {
        let mut headers = HashMap::new();
        headers.insert("destination".to_string(), destination.to_string());
        headers.insert("content-length".to_string(), body.len().to_string());
        self.write_frame(&RawFrame {
            command: "SEND".to_string(),
            headers,
            body: body.to_vec(),
        })
        .await
    }

    async fn disconnect(&mut self) -> Result<(), AgentError> {
        if self.conn.is_some() {
            let _ = self
                .write_frame(&RawFrame {
                    command: "DISCONNECT".to_string(),
                    headers: HashMap::new(),
                    body: Vec::new(),
                })
                .await;
        }
        self.conn = None;
        Ok(())
    }
}

struct RawFrame {
    command: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl RawFrame {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(self.command.as_bytes());
        out.push(b'\n');
        for (key, value) in &self.headers {
            out.extend_from_slice(key.as_bytes());
            out.push(b':');
            out.extend_from_slice(value.as_bytes());
            out.push(b'\n');
        }
        out.push(b'\n');
        out.extend_from_slice(&self.body);
        out.push(0);
        out
    }

    fn parse(buf: &[u8]) -> Option<RawFrame> {
        let mut lines = buf.splitn(2, |&b| b == b'\n');
        let command = String::from_utf8_lossy(lines.next()?).trim().to_string();
        let rest = lines.next()?;

        let header_body_split = find_double_newline(rest)?;
        let (header_bytes, body_with_leading_nl) = rest.split_at(header_body_split);
        let body = if body_with_leading_nl.len() >= 2 {
            body_with_leading_nl[2..].to_vec()
        } else {
            Vec::new()
        };

        let mut headers = HashMap::new();
        for line in header_bytes.split(|&b| b == b'\n') {
            if line.is_empty() {
                continue;
            }
            if let Some(colon) = line.iter().position(|&b| b == b':') {
                let key = String::from_utf8_lossy(&line[..colon]).to_string();
                let value = String::from_utf8_lossy(&line[colon + 1..]).to_string();
                headers.insert(key, value);
            }
        }

        Some(RawFrame {
            command,
            headers,
            body,
        })
    }
}

fn find_double_newline(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}
