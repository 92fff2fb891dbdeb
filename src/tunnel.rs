//! JSON-lines RPC tunnel between the agent and the host process.
//!
//! The host starts the agent with its stdio attached and answers requests on
//! the other end of the pipe. The link is a single blocking duplex channel
//! with no timeout: an unresponsive host blocks the caller indefinitely.
//! Mount transfers are carried as base64 chunk frames on the same link.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::workspace::Mount;

/// Request sent from agent to host.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TunnelRequest {
    Ping,
    StreamMount { mount: String },
    Credentials { payload: String },
    Result { payload: String },
}

/// Response sent from host to agent.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TunnelResponse {
    Ok,
    Error { message: String },
    Credentials { payload: String },
    Chunk { data: String },
    End,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("host channel closed")]
    Closed,
    #[error("host rejected request: {0}")]
    Rejected(String),
    #[error("malformed tunnel frame: {0}")]
    Malformed(String),
}

struct Transport {
    reader: Box<dyn BufRead + Send>,
    writer: Box<dyn Write + Send>,
}

impl Transport {
    fn send(&mut self, request: &TunnelRequest) -> Result<()> {
        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        self.writer
            .write_all(line.as_bytes())
            .map_err(|_| ProtocolError::Closed)?;
        self.writer.flush().map_err(|_| ProtocolError::Closed)?;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<TunnelResponse> {
        let mut line = String::new();
        let n = self
            .reader
            .read_line(&mut line)
            .map_err(|_| ProtocolError::Closed)?;
        if n == 0 {
            return Err(ProtocolError::Closed.into());
        }
        let response = serde_json::from_str(line.trim())
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        Ok(response)
    }

    fn call(&mut self, request: &TunnelRequest) -> Result<TunnelResponse> {
        self.send(request)?;
        self.read_frame()
    }
}

/// Clonable handle to the tunnel. Calls serialize through an internal mutex
/// so the credential server threads can share the link with the
/// orchestrator.
#[derive(Clone)]
pub struct TunnelClient {
    transport: Arc<Mutex<Transport>>,
}

impl TunnelClient {
    pub fn new(
        reader: impl BufRead + Send + 'static,
        writer: impl Write + Send + 'static,
    ) -> Self {
        Self {
            transport: Arc::new(Mutex::new(Transport {
                reader: Box::new(reader),
                writer: Box::new(writer),
            })),
        }
    }

    /// The production transport: the process stdio owned by the host.
    pub fn over_stdio() -> Self {
        Self::new(BufReader::new(io::stdin()), io::stdout())
    }

    fn call(&self, request: &TunnelRequest) -> Result<TunnelResponse> {
        let mut transport = self
            .transport
            .lock()
            .map_err(|_| anyhow!("tunnel transport poisoned"))?;
        transport.call(request)
    }

    /// First exchange of every run; failure means the host is unreachable.
    pub fn ping(&self) -> Result<()> {
        match self.call(&TunnelRequest::Ping)? {
            TunnelResponse::Ok => Ok(()),
            TunnelResponse::Error { message } => Err(ProtocolError::Rejected(message).into()),
            other => Err(ProtocolError::Malformed(format!("{other:?}")).into()),
        }
    }

    /// One-shot terminal call carrying the serialized setup result.
    pub fn send_result(&self, payload: &str) -> Result<()> {
        let request = TunnelRequest::Result {
            payload: payload.to_string(),
        };
        match self.call(&request)? {
            TunnelResponse::Ok => Ok(()),
            TunnelResponse::Error { message } => Err(ProtocolError::Rejected(message).into()),
            other => Err(ProtocolError::Malformed(format!("{other:?}")).into()),
        }
    }

    /// Forwards a credential request to the host and returns its answer.
    pub fn credentials(&self, payload: &str) -> Result<String> {
        let request = TunnelRequest::Credentials {
            payload: payload.to_string(),
        };
        match self.call(&request)? {
            TunnelResponse::Credentials { payload } => Ok(payload),
            TunnelResponse::Error { message } => Err(ProtocolError::Rejected(message).into()),
            other => Err(ProtocolError::Malformed(format!("{other:?}")).into()),
        }
    }

    /// Opens a transfer for one mount. The returned stream yields the raw
    /// archive bytes carried in the response chunk frames.
    pub fn stream_mount(&self, mount: &Mount) -> Result<MountStream> {
        let request = TunnelRequest::StreamMount {
            mount: mount.to_string(),
        };
        match self.call(&request)? {
            TunnelResponse::Ok => Ok(MountStream {
                client: self.clone(),
                buffer: Vec::new(),
                offset: 0,
                done: false,
            }),
            TunnelResponse::Error { message } => Err(ProtocolError::Rejected(message).into()),
            other => Err(ProtocolError::Malformed(format!("{other:?}")).into()),
        }
    }
}

/// Blocking reader over the chunk frames of one mount transfer.
pub struct MountStream {
    client: TunnelClient,
    buffer: Vec<u8>,
    offset: usize,
    done: bool,
}

impl MountStream {
    fn next_chunk(&mut self) -> Result<()> {
        let mut transport = self
            .client
            .transport
            .lock()
            .map_err(|_| anyhow!("tunnel transport poisoned"))?;
        match transport.read_frame()? {
            TunnelResponse::Chunk { data } => {
                self.buffer = STANDARD
                    .decode(data.as_bytes())
                    .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
                self.offset = 0;
                Ok(())
            }
            TunnelResponse::End => {
                self.done = true;
                Ok(())
            }
            TunnelResponse::Error { message } => Err(ProtocolError::Rejected(message).into()),
            other => Err(ProtocolError::Malformed(format!("{other:?}")).into()),
        }
    }
}

impl Read for MountStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.offset >= self.buffer.len() {
            if self.done {
                return Ok(0);
            }
            self.next_chunk().map_err(io::Error::other)?;
        }
        let n = (self.buffer.len() - self.offset).min(buf.len());
        buf[..n].copy_from_slice(&self.buffer[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Write half shared with the test so requests can be inspected.
    #[derive(Clone, Default)]
    pub struct SharedWriter(pub Arc<Mutex<Vec<u8>>>);

    impl Write for SharedWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn scripted(responses: &[TunnelResponse]) -> (TunnelClient, SharedWriter) {
        let mut script = String::new();
        for response in responses {
            script.push_str(&serde_json::to_string(response).unwrap());
            script.push('\n');
        }
        let writer = SharedWriter::default();
        let client = TunnelClient::new(Cursor::new(script.into_bytes()), writer.clone());
        (client, writer)
    }

    fn sent_lines(writer: &SharedWriter) -> Vec<String> {
        String::from_utf8(writer.0.lock().unwrap().clone())
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_ping_ok() {
        let (client, writer) = scripted(&[TunnelResponse::Ok]);
        client.ping().unwrap();
        assert_eq!(sent_lines(&writer), vec![r#"{"type":"Ping"}"#]);
    }

    #[test]
    fn test_ping_rejected() {
        let (client, _) = scripted(&[TunnelResponse::Error {
            message: "no host".to_string(),
        }]);
        let err = client.ping().unwrap_err();
        assert!(err.to_string().contains("no host"));
    }

    #[test]
    fn test_ping_on_closed_channel() {
        let (client, _) = scripted(&[]);
        let err = client.ping().unwrap_err();
        assert!(err.to_string().contains("closed"));
    }

    #[test]
    fn test_send_result_round_trip() {
        let (client, writer) = scripted(&[TunnelResponse::Ok]);
        client.send_result("{\"done\":true}").unwrap();
        let lines = sent_lines(&writer);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("\"type\":\"Result\""));
        assert!(lines[0].contains("done"));
    }

    #[test]
    fn test_credentials_returns_payload() {
        let (client, _) = scripted(&[TunnelResponse::Credentials {
            payload: "username=me".to_string(),
        }]);
        assert_eq!(client.credentials("host=x").unwrap(), "username=me");
    }

    #[test]
    fn test_stream_mount_decodes_chunks() {
        let (client, writer) = scripted(&[
            TunnelResponse::Ok,
            TunnelResponse::Chunk {
                data: STANDARD.encode(b"hello "),
            },
            TunnelResponse::Chunk {
                data: STANDARD.encode(b"world"),
            },
            TunnelResponse::End,
        ]);
        let mount = Mount {
            source: "/a".to_string(),
            target: "/b".to_string(),
        };
        let mut stream = client.stream_mount(&mount).unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello world");
        assert!(sent_lines(&writer)[0].contains("src=/a,dst=/b"));
    }

    #[test]
    fn test_stream_mount_rejected() {
        let (client, _) = scripted(&[TunnelResponse::Error {
            message: "unknown mount".to_string(),
        }]);
        let mount = Mount::default();
        assert!(client.stream_mount(&mount).is_err());
    }

    #[test]
    fn test_request_serialization_is_tagged() {
        let json = serde_json::to_string(&TunnelRequest::StreamMount {
            mount: "src=/a,dst=/b".to_string(),
        })
        .unwrap();
        assert!(json.contains("\"type\":\"StreamMount\""));
        let parsed: TunnelRequest = serde_json::from_str(&json).unwrap();
        match parsed {
            TunnelRequest::StreamMount { mount } => assert_eq!(mount, "src=/a,dst=/b"),
            other => panic!("wrong variant: {other:?}"),
        }
    }
}
