//! Command protocol spoken with the remote peer
//!
//! On the wire every request and response is a [`CommandMessage`] JSON
//! object with exactly the fields `command`, `Args`, `error` and
//! `requestSerial`. Inside the crate commands are handled as the typed
//! [`Command`] union and only converted at the protocol boundary.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Number of random bytes behind a request serial (16 hex characters)
pub const REQUEST_SERIAL_BYTES: usize = 8;

/// Wire representation of a request or response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandMessage {
    pub command: String,
    #[serde(rename = "Args")]
    pub args: Vec<Value>,
    pub error: Option<i64>,
    #[serde(rename = "requestSerial")]
    pub request_serial: String,
}

impl CommandMessage {
    /// Build a message with a fresh correlation token
    pub fn new(command: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            command: command.into(),
            args,
            error: None,
            request_serial: new_request_serial(),
        }
    }

    /// Build the response to `request`, echoing its serial
    pub fn reply_to(request: &CommandMessage, error: Option<i64>, args: Vec<Value>) -> Self {
        Self {
            command: request.command.clone(),
            args,
            error,
            request_serial: request.request_serial.clone(),
        }
    }

    /// Responses use `-1` (or null) for success
    pub fn is_error(&self) -> bool {
        matches!(self.error, Some(code) if code > -1)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Generate a random lowercase-hex correlation token
pub fn new_request_serial() -> String {
    let mut bytes = [0u8; REQUEST_SERIAL_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Check that a serial has the fixed shape produced by [`new_request_serial`]
pub fn is_valid_serial(serial: &str) -> bool {
    serial.len() == REQUEST_SERIAL_BYTES * 2
        && serial
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

/// Known commands, decoded at the protocol boundary
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Ask the peer to open a gateway connection with the given parameters
    ConnectRequest(Value),
    /// Forward the decrypted activation payload
    ActivePassword(Value),
    /// Ask the peer for its available regions
    GetAvailableRegion,
    /// Commands this build does not know about
    Other { command: String, args: Vec<Value> },
}

const CONNECT_REQUEST: &str = "connectRequest";
const ACTIVE_PASSWORD: &str = "activePassword";
// Spelling is part of the wire protocol.
const GET_AVAILABLE_REGION: &str = "getAvaliableRegion";

impl Command {
    pub fn name(&self) -> &str {
        match self {
            Command::ConnectRequest(_) => CONNECT_REQUEST,
            Command::ActivePassword(_) => ACTIVE_PASSWORD,
            Command::GetAvailableRegion => GET_AVAILABLE_REGION,
            Command::Other { command, .. } => command,
        }
    }

    /// Convert into a wire message with a fresh serial
    pub fn into_message(self) -> CommandMessage {
        let name = self.name().to_string();
        let args = match self {
            Command::ConnectRequest(arg) | Command::ActivePassword(arg) => vec![arg],
            Command::GetAvailableRegion => Vec::new(),
            Command::Other { args, .. } => args,
        };
        CommandMessage::new(name, args)
    }

    /// Decode the command carried by a wire message
    pub fn decode(message: &CommandMessage) -> Self {
        let first = || message.args.first().cloned().unwrap_or(Value::Null);
        match message.command.as_str() {
            CONNECT_REQUEST => Command::ConnectRequest(first()),
            ACTIVE_PASSWORD => Command::ActivePassword(first()),
            GET_AVAILABLE_REGION => Command::GetAvailableRegion,
            other => Command::Other {
                command: other.to_string(),
                args: message.args.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_field_names() {
        let msg = CommandMessage {
            command: "getAvaliableRegion".to_string(),
            args: vec![json!("a"), json!(1)],
            error: None,
            request_serial: "0123456789abcdef".to_string(),
        };
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj.len(), 4);
        assert_eq!(obj["command"], json!("getAvaliableRegion"));
        assert_eq!(obj["Args"], json!(["a", 1]));
        assert_eq!(obj["error"], Value::Null);
        assert_eq!(obj["requestSerial"], json!("0123456789abcdef"));
    }

    #[test]
    fn test_parse_peer_response() {
        let raw = br#"{"command":"activePassword","Args":["a2V5"],"error":-1,"requestSerial":"aaaaaaaaaaaaaaaa"}"#;
        let msg = CommandMessage::from_json(raw).unwrap();
        assert_eq!(msg.error, Some(-1));
        assert!(!msg.is_error());
        assert_eq!(msg.request_serial, "aaaaaaaaaaaaaaaa");
    }

    #[test]
    fn test_serial_shape() {
        let a = new_request_serial();
        let b = new_request_serial();
        assert!(is_valid_serial(&a));
        assert!(is_valid_serial(&b));
        assert_ne!(a, b);
        assert!(!is_valid_serial("ABCDEF0123456789"));
        assert!(!is_valid_serial("abc"));
    }

    #[test]
    fn test_command_decode() {
        let msg = Command::ActivePassword(json!({"code": 1})).into_message();
        assert_eq!(msg.command, "activePassword");
        assert_eq!(Command::decode(&msg), Command::ActivePassword(json!({"code": 1})));

        let msg = Command::GetAvailableRegion.into_message();
        assert!(msg.args.is_empty());
        assert_eq!(Command::decode(&msg), Command::GetAvailableRegion);

        let msg = CommandMessage::new("somethingNew", vec![json!(1), json!(2)]);
        assert_eq!(
            Command::decode(&msg),
            Command::Other {
                command: "somethingNew".to_string(),
                args: vec![json!(1), json!(2)],
            }
        );
    }

    #[test]
    fn test_reply_echoes_serial() {
        let req = Command::GetAvailableRegion.into_message();
        let resp = CommandMessage::reply_to(&req, Some(2), vec![]);
        assert_eq!(resp.request_serial, req.request_serial);
        assert!(resp.is_error());
    }
}
