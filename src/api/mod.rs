pub mod auth;
mod sync_websocket;
mod transactions;

use std::sync::Arc;

use asmux_service::Services;
use axum::{
	Router,
	routing::{get, put},
};

/// Builds the router for everything asmux serves itself; the
/// client-to-homeserver reverse proxy is a separate concern.
pub fn router(services: &Arc<Services>) -> Router {
	Router::new()
		.route(
			"/_matrix/app/v1/transactions/{txn_id}",
			put(transactions::handle_transaction),
		)
		// legacy unprefixed path, same as the python-era servers accepted
		.route("/transactions/{txn_id}", put(transactions::handle_transaction))
		.route(
			"/_matrix/client/unstable/fi.mau.as_sync",
			get(sync_websocket::handle_upgrade),
		)
		.with_state(services.clone())
}
