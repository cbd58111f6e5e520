use serde::Deserialize;
use serde_json::Value;

/// Websocket subprotocol spoken on `fi.mau.as_sync`.
pub const PROTOCOL: &str = "fi.mau.as_sync";

pub const PROCESS_ID_HEADER: &str = "X-Mautrix-Process-ID";
pub const VERSION_HEADER: &str = "X-Mautrix-Websocket-Version";

/// First protocol version whose clients acknowledge transactions.
pub const VERSION_ACKS: u32 = 2;

/// First protocol version that handles duplicate txn ids idempotently,
/// making retry-on-timeout safe.
pub const VERSION_IDEMPOTENT_RETRY: u32 = 3;

pub const CLOSE_CONN_REPLACED: u16 = 4001;
pub const CLOSE_NOT_ACKNOWLEDGED: u16 = 4002;
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;
pub const CLOSE_SERVICE_RESTART: u16 = 1012;

pub const STATUS_CONN_REPLACED: &str = "conn_replaced";
pub const STATUS_NOT_ACKNOWLEDGED: &str = "transactions_not_acknowledged";
pub const STATUS_SERVER_SHUTTING_DOWN: &str = "server_shutting_down";
pub const STATUS_CONSUMER_FAILED: &str = "queue_consumer_failed";

/// One frame read off the socket. Bridges send acks (`response`/`error`
/// with the request's id) and their own requests (any other command).
#[derive(Debug, Deserialize)]
pub(crate) struct IncomingFrame {
	#[serde(default)]
	pub(crate) id: Option<u64>,

	#[serde(default)]
	pub(crate) command: String,

	#[serde(default)]
	pub(crate) data: Value,
}

#[cfg(test)]
mod tests {
	use super::IncomingFrame;

	#[test]
	fn ack_frame_parses() {
		let frame: IncomingFrame =
			serde_json::from_str(r#"{"id": 3, "command": "response", "data": true}"#).unwrap();
		assert_eq!(frame.id, Some(3));
		assert_eq!(frame.command, "response");
	}

	#[test]
	fn bare_command_parses() {
		let frame: IncomingFrame =
			serde_json::from_str(r#"{"command": "ping", "id": 1}"#).unwrap();
		assert_eq!(frame.command, "ping");
		assert!(frame.data.is_null());
	}
}
