//! Inbound data stream
//!
//! Notification payloads are opaque bytes carrying UTF-8 text. Decoded values
//! land in an append-only [`MessageLog`]; undecodable values are skipped.

use std::str::Utf8Error;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;
use tokio::sync::mpsc::Receiver;

/// One decoded inbound value
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InboundMessage {
    pub peripheral_id: String,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

/// Ordered, append-only log of inbound messages, shared between the session
/// pump and readers
#[derive(Debug, Clone, Default)]
pub struct MessageLog {
    entries: Arc<RwLock<Vec<InboundMessage>>>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, message: InboundMessage) {
        match self.entries.write() {
            Ok(mut entries) => entries.push(message),
            Err(poisoned) => poisoned.into_inner().push(message),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of every entry, oldest first
    pub fn snapshot(&self) -> Vec<InboundMessage> {
        self.entries.read().map(|e| e.clone()).unwrap_or_default()
    }

    /// Entries appended after the first `offset`
    pub fn since(&self, offset: usize) -> Vec<InboundMessage> {
        self.entries
            .read()
            .map(|e| e.iter().skip(offset).cloned().collect())
            .unwrap_or_default()
    }
}

/// Decode a notification value into text
///
/// Trailing NUL, CR and LF padding is dropped.
pub fn decode_payload(bytes: &[u8]) -> Result<String, Utf8Error> {
    let text = std::str::from_utf8(bytes)?;
    Ok(text.trim_end_matches(['\0', '\r', '\n']).to_string())
}

/// Drain a subscription into the log until the channel closes
///
/// Returns once the link has dropped; the caller turns that into a link-loss
/// transition.
pub async fn pump_notifications(peripheral_id: String, mut values: Receiver<Vec<u8>>, log: MessageLog) {
    while let Some(value) = values.recv().await {
        match decode_payload(&value) {
            Ok(text) => {
                debug!("Received {} bytes from {}", value.len(), peripheral_id);
                log.append(InboundMessage {
                    peripheral_id: peripheral_id.clone(),
                    text,
                    received_at: Utc::now(),
                });
            }
            Err(e) => {
                warn!("Skipping undecodable value from {}: {}", peripheral_id, e);
            }
        }
    }
    debug!("Notification stream from {} closed", peripheral_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::channel;

    #[test]
    fn test_decode_trims_padding() {
        assert_eq!(decode_payload(b"turn left\r\n\0\0").ok(), Some("turn left".to_string()));
        assert_eq!(decode_payload(b"").ok(), Some(String::new()));
        assert!(decode_payload(&[0xff, 0xfe]).is_err());
    }

    #[tokio::test]
    async fn test_pump_skips_invalid_values() {
        let (tx, rx) = channel(8);
        let log = MessageLog::new();

        tx.send(b"one".to_vec()).await.unwrap();
        tx.send(vec![0xc3, 0x28]).await.unwrap();
        tx.send(b"two\n".to_vec()).await.unwrap();
        drop(tx);

        pump_notifications("AA:01".into(), rx, log.clone()).await;

        let texts: Vec<String> = log.snapshot().into_iter().map(|m| m.text).collect();
        assert_eq!(texts, vec!["one", "two"]);
        assert_eq!(log.since(1).len(), 1);
    }
}
