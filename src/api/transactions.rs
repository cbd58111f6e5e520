use std::{collections::BTreeMap, sync::Arc};

use asmux_core::{Result, matrix::DeviceLists};
use asmux_service::Services;
use axum::{
	Json,
	extract::{Path, Query, State},
};
use http::HeaderMap;
use ruma::OwnedUserId;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::auth;

pub(crate) const SYNCHRONOUS_TO_KEY: &str = "com.beeper.asmux.synchronous_to";

#[derive(Deserialize)]
pub(crate) struct Transaction {
	#[serde(default)]
	events: Vec<Value>,

	#[serde(default)]
	ephemeral: Vec<Value>,

	#[serde(default)]
	device_one_time_keys_count: BTreeMap<OwnedUserId, Value>,

	#[serde(default)]
	device_lists: DeviceLists,

	#[serde(flatten)]
	extra_data: Map<String, Value>,
}

#[derive(Deserialize)]
pub(crate) struct AccessToken {
	access_token: Option<String>,
}

/// `PUT /_matrix/app/v1/transactions/{txn_id}` — the homeserver pushing a
/// batch of events at the proxy. The response covers only the appservice
/// ids the homeserver asked to wait for.
pub(crate) async fn handle_transaction(
	State(services): State<Arc<Services>>,
	Path(txn_id): Path<String>,
	Query(query): Query<AccessToken>,
	headers: HeaderMap,
	Json(transaction): Json<Transaction>,
) -> Result<Json<BTreeMap<String, bool>>> {
	let token = query
		.access_token
		.as_deref()
		.or_else(|| auth::bearer_token(&headers));
	auth::check_hs_token(&services, token)?;

	let synchronous_to = transaction
		.extra_data
		.get(SYNCHRONOUS_TO_KEY)
		.and_then(Value::as_array)
		.map(|ids| {
			ids.iter()
				.filter_map(Value::as_str)
				.map(str::to_owned)
				.collect()
		})
		.unwrap_or_default();

	let results = services
		.routing
		.handle_transaction(
			&txn_id,
			transaction.events,
			transaction.ephemeral,
			transaction.device_one_time_keys_count,
			transaction.device_lists,
			synchronous_to,
		)
		.await?;

	Ok(Json(results))
}
