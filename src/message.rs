//! Control messages exchanged between file servers.
//!
//! Messages travel inside `0x1` control frames as tagged JSON. Adding a kind of
//! message means adding a variant here; every handler matches exhaustively.

use serde::{Deserialize, Serialize};

use crate::p2p::encode_message;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// A stream of exactly `size` bytes for `key` in namespace `id` follows
    /// immediately on the same connection.
    StoreFile { id: String, key: String, size: u64 },
    /// Ask peers to send back `key` from namespace `id` if they hold it.
    GetFile { id: String, key: String },
}

impl Message {
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }

    /// Encode and wrap in a control frame, ready for the wire.
    pub fn to_frame(&self) -> serde_json::Result<Vec<u8>> {
        Ok(encode_message(&self.encode()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::INCOMING_MESSAGE;

    #[test]
    fn test_store_file_is_tagged() {
        let msg = Message::StoreFile {
            id: "node".to_string(),
            key: "picture.jpg".to_string(),
            size: 42,
        };
        let json: serde_json::Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();

        assert_eq!(json["type"], "store_file");
        assert_eq!(json["key"], "picture.jpg");
        assert_eq!(json["size"], 42);
        assert_eq!(Message::decode(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        assert!(Message::decode(br#"{"type":"delete_file","key":"x"}"#).is_err());
        assert!(Message::decode(b"not json").is_err());
    }

    #[test]
    fn test_to_frame() {
        let msg = Message::GetFile {
            id: "node".to_string(),
            key: "k".to_string(),
        };
        let frame = msg.to_frame().unwrap();
        let payload = msg.encode().unwrap();

        assert_eq!(frame[0], INCOMING_MESSAGE);
        assert_eq!(&frame[1..5], &(payload.len() as u32).to_be_bytes());
        assert_eq!(&frame[5..], &payload[..]);
    }
}
