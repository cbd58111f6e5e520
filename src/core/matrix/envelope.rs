use std::collections::{BTreeMap, BTreeSet};

use ruma::OwnedUserId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// PDUs older than this are evicted before delivery unless the owner sent
/// them.
pub const MAX_PDU_AGE_MS: u64 = 3 * 60 * 1000;

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct DeviceLists {
	#[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
	pub changed: BTreeSet<OwnedUserId>,

	#[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
	pub left: BTreeSet<OwnedUserId>,
}

impl DeviceLists {
	#[inline]
	#[must_use]
	pub fn is_empty(&self) -> bool { self.changed.is_empty() && self.left.is_empty() }

	pub fn extend(&mut self, other: Self) {
		self.changed.extend(other.changed);
		self.left.extend(other.left);
	}
}

/// One transaction envelope: the unit pushed onto appservice queues and
/// delivered over HTTP or websocket. Event payloads stay opaque JSON; only
/// the fields the router and the stale policy look at are ever inspected.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Events {
	#[serde(default)]
	pub txn_id: String,

	#[serde(rename = "events", default)]
	pub pdu: Vec<Value>,

	#[serde(rename = "ephemeral", default, skip_serializing_if = "Vec::is_empty")]
	pub edu: Vec<Value>,

	// parallel event-type labels used for metrics only; carried on queue
	// entries, stripped from delivery bodies by to_wire()
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub types: Vec<String>,

	#[serde(
		rename = "one_time_keys_count",
		default,
		skip_serializing_if = "BTreeMap::is_empty"
	)]
	pub otk_count: BTreeMap<OwnedUserId, Value>,

	#[serde(default, skip_serializing_if = "DeviceLists::is_empty")]
	pub device_lists: DeviceLists,
}

impl Events {
	#[must_use]
	pub fn new(txn_id: &str) -> Self {
		Self { txn_id: txn_id.to_owned(), ..Default::default() }
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.pdu.is_empty()
			&& self.edu.is_empty()
			&& self.types.is_empty()
			&& self.otk_count.is_empty()
			&& self.device_lists.is_empty()
	}

	/// Folds another envelope into this one: txn ids are comma-joined,
	/// event lists concatenated in arrival order, one-time-key counts
	/// merged with the later entry winning, device list sets unioned.
	pub fn merge(&mut self, other: Self) {
		if self.txn_id.is_empty() {
			self.txn_id = other.txn_id;
		} else {
			self.txn_id = format!("{},{}", self.txn_id, other.txn_id);
		}

		self.types.extend(other.types);
		self.pdu.extend(other.pdu);
		self.edu.extend(other.edu);
		self.otk_count.extend(other.otk_count);
		self.device_lists.extend(other.device_lists);
	}

	/// Removes PDUs older than `max_age_ms` and returns them. Events sent
	/// by the owner are never evicted so a bridge user's own outgoing
	/// messages survive a long disconnect. `types` is left untouched; it
	/// only labels metrics.
	pub fn pop_expired_pdu(&mut self, owner_mxid: &str, max_age_ms: u64) -> Vec<Value> {
		let now = crate::utils::time::now_millis();
		let mut expired = Vec::new();

		self.pdu.retain(|event| {
			let sender = event.get("sender").and_then(Value::as_str);
			if sender == Some(owner_mxid) {
				return true;
			}

			let ts = event
				.get("origin_server_ts")
				.and_then(Value::as_u64)
				.unwrap_or(0);
			if now.saturating_sub(ts) > max_age_ms {
				expired.push(event.clone());
				return false;
			}

			true
		});

		expired
	}

	/// Delivery body: the serialized envelope without the internal `types`
	/// labels.
	#[must_use]
	pub fn to_wire(&self) -> Value {
		let mut value = serde_json::to_value(self).expect("envelope serializes");
		if let Some(object) = value.as_object_mut() {
			object.remove("types");
		}

		value
	}
}

#[cfg(test)]
mod tests {
	use serde_json::{Value, json};

	use super::{Events, MAX_PDU_AGE_MS};
	use crate::utils::time::now_millis;

	fn pdu(sender: &str, age_ms: u64) -> Value {
		json!({
			"type": "m.room.message",
			"sender": sender,
			"room_id": "!r1:example.com",
			"origin_server_ts": now_millis().saturating_sub(age_ms),
		})
	}

	fn envelope(txn_id: &str, pdus: usize, edus: usize) -> Events {
		let mut events = Events::new(txn_id);
		for _ in 0..pdus {
			events.pdu.push(pdu("@someone:example.com", 0));
			events.types.push("m.room.message".to_owned());
		}
		for _ in 0..edus {
			events.edu.push(json!({"type": "m.typing"}));
			events.types.push("m.typing".to_owned());
		}

		events
	}

	#[test]
	fn merge_concatenates_and_joins_txn_ids() {
		let mut combined = Events::default();
		let batches = [envelope("t1", 2, 1), envelope("t2", 1, 0), envelope("t3", 0, 2)];

		let pdus: usize = batches.iter().map(|t| t.pdu.len()).sum();
		let edus: usize = batches.iter().map(|t| t.edu.len()).sum();
		let types: usize = batches.iter().map(|t| t.types.len()).sum();
		for batch in batches {
			combined.merge(batch);
		}

		assert_eq!(combined.txn_id, "t1,t2,t3");
		assert_eq!(combined.pdu.len(), pdus);
		assert_eq!(combined.edu.len(), edus);
		assert_eq!(combined.types.len(), types);
	}

	#[test]
	fn merge_unions_otk_and_device_lists() {
		let user: ruma::OwnedUserId = "@a:example.com".try_into().unwrap();

		let mut first = Events::new("t1");
		first
			.otk_count
			.insert(user.clone(), json!({"signed_curve25519": 10}));
		first.device_lists.changed.insert(user.clone());

		let mut second = Events::new("t2");
		second
			.otk_count
			.insert(user.clone(), json!({"signed_curve25519": 2}));
		second
			.device_lists
			.left
			.insert("@b:example.com".try_into().unwrap());

		first.merge(second);
		assert_eq!(first.otk_count[&user], json!({"signed_curve25519": 2}));
		assert_eq!(first.device_lists.changed.len(), 1);
		assert_eq!(first.device_lists.left.len(), 1);
	}

	#[test]
	fn stale_pdus_evicted_unless_owner_sent() {
		let owner = "@acme:example.com";
		let mut events = Events::new("t1");
		events.pdu.push(pdu("@other:example.com", 200_000));
		events.pdu.push(pdu(owner, 200_000));
		events.pdu.push(pdu("@other:example.com", 1_000));

		let expired = events.pop_expired_pdu(owner, MAX_PDU_AGE_MS);
		assert_eq!(expired.len(), 1);
		assert_eq!(events.pdu.len(), 2);
		assert_eq!(expired[0]["sender"], "@other:example.com");
		assert!(events.pdu.iter().any(|e| e["sender"] == owner));
	}

	#[test]
	fn empty_fields_omitted_on_wire() {
		let events = envelope("t1", 1, 0);
		let wire = events.to_wire();
		let object = wire.as_object().unwrap();

		assert!(object.contains_key("events"));
		assert!(object.contains_key("txn_id"));
		assert!(!object.contains_key("ephemeral"));
		assert!(!object.contains_key("one_time_keys_count"));
		assert!(!object.contains_key("device_lists"));
		assert!(!object.contains_key("types"));
	}

	#[test]
	fn queue_serialization_keeps_types() {
		let events = envelope("t1", 1, 1);
		let raw = serde_json::to_string(&events).unwrap();
		let back: Events = serde_json::from_str(&raw).unwrap();

		assert_eq!(back.types, events.types);
		assert_eq!(back.txn_id, "t1");
	}

	#[test]
	fn emptiness() {
		assert!(Events::new("t1").is_empty());
		assert!(!envelope("t1", 0, 1).is_empty());
	}
}
