use crate::{
    error::Result,
    transport::{Connection, Connector, TransportEvent, EVENT_BUFFER},
};
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        unix::{OwnedReadHalf, OwnedWriteHalf},
        UnixStream,
    },
    sync::mpsc,
};
use tracing::{debug, error, info, warn};

const READ_CHUNK: usize = 8 * 1024;

/// Connects to a node's IPC socket.
#[derive(Debug, Clone)]
pub struct IpcConnector {
    path: PathBuf,
}

impl IpcConnector {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl Connector for IpcConnector {
    async fn connect(&self) -> Result<Connection> {
        let stream = UnixStream::connect(&self.path).await?;
        info!("IPC connection established at {}", self.path.display());

        let (reader, writer) = stream.into_split();
        let (outgoing, outgoing_rx) = mpsc::channel(EVENT_BUFFER);
        let (events, incoming) = mpsc::channel(EVENT_BUFFER);

        tokio::spawn(write_messages(writer, outgoing_rx));
        tokio::spawn(read_messages(reader, events));

        Ok(Connection { outgoing, incoming })
    }
}

async fn write_messages(mut writer: OwnedWriteHalf, mut outgoing: mpsc::Receiver<String>) {
    while let Some(mut text) = outgoing.recv().await {
        text.push('\n');
        if let Err(e) = writer.write_all(text.as_bytes()).await {
            error!("Failed to write to IPC socket: {}", e);
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_messages(mut reader: OwnedReadHalf, events: mpsc::Sender<TransportEvent>) {
    let mut decoder = JsonStreamDecoder::default();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                info!("IPC socket closed");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                error!("IPC read error: {}", e);
                let _ = events.send(TransportEvent::Error(e.to_string())).await;
                break;
            }
        };

        for message in decoder.push(&buf[..n]) {
            if events.send(TransportEvent::Message(message)).await.is_err() {
                return;
            }
        }
    }

    let _ = events.send(TransportEvent::Close).await;
}

/// Splits a byte stream of back-to-back JSON values. Values may arrive cut at
/// arbitrary chunk boundaries and need no delimiter between them.
#[derive(Debug, Default)]
pub struct JsonStreamDecoder {
    buffer: Vec<u8>,
}

impl JsonStreamDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.buffer.extend_from_slice(chunk);

        let mut values = Vec::new();
        let mut stream = serde_json::Deserializer::from_slice(&self.buffer).into_iter::<Value>();
        let mut consumed = 0;
        loop {
            match stream.next() {
                Some(Ok(value)) => {
                    consumed = stream.byte_offset();
                    values.push(value);
                }
                Some(Err(e)) if e.is_eof() => break,
                Some(Err(e)) => {
                    warn!("Dropping undecodable IPC data: {}", e);
                    consumed = self.buffer.len();
                    break;
                }
                None => {
                    consumed = self.buffer.len();
                    break;
                }
            }
        }

        self.buffer.drain(..consumed);
        if !self.buffer.is_empty() {
            debug!("{} bytes of partial IPC message buffered", self.buffer.len());
        }
        values
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_values_split_across_chunks() {
        let mut decoder = JsonStreamDecoder::default();
        assert!(decoder.push(br#"{"jsonrpc":"2.0","id":1,"res"#).is_empty());
        assert!(decoder.buffered() > 0);

        let values = decoder.push(br#"ult":"0x1"}{"jsonrpc":"2.0","id":2,"result":null}"#);
        assert_eq!(
            values,
            vec![
                json!({"jsonrpc": "2.0", "id": 1, "result": "0x1"}),
                json!({"jsonrpc": "2.0", "id": 2, "result": null}),
            ]
        );
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn newline_separated_values_and_batches() {
        let mut decoder = JsonStreamDecoder::default();
        let values = decoder.push(b"{\"id\":1,\"result\":1}\n[{\"id\":2,\"result\":2}]\n");
        assert_eq!(values.len(), 2);
        assert!(values[1].is_array());
    }

    #[test]
    fn garbage_is_dropped() {
        let mut decoder = JsonStreamDecoder::default();
        assert!(decoder.push(b"}}not json").is_empty());
        assert_eq!(decoder.buffered(), 0);
        assert_eq!(decoder.push(br#"{"id":3,"result":3}"#).len(), 1);
    }
}
