use std::sync::Arc;

use asmux_core::{Err, Result};
use asmux_service::{Services, websocket::proto};
use axum::{
	extract::{State, WebSocketUpgrade},
	response::Response,
};
use http::HeaderMap;

use crate::auth;

/// `GET /_matrix/client/unstable/fi.mau.as_sync` — a bridge connecting
/// its transaction websocket.
pub(crate) async fn handle_upgrade(
	State(services): State<Arc<Services>>,
	headers: HeaderMap,
	ws: WebSocketUpgrade,
) -> Result<Response> {
	if services.server.is_stopping() {
		return Err!(Request(SERVICE_UNAVAILABLE, "Server is shutting down"));
	}

	let Some(token) = auth::bearer_token(&headers) else {
		return Err!(Request(UNAUTHORIZED, "Missing authorization header"));
	};

	let appservice = auth::find_appservice(&services, token).await?;
	if appservice.push {
		return Err!(Request(FORBIDDEN, "This appservice is not websocket-enabled"));
	}

	let process_id = headers
		.get(proto::PROCESS_ID_HEADER)
		.and_then(|value| value.to_str().ok())
		.unwrap_or_default()
		.to_owned();
	let version = headers
		.get(proto::VERSION_HEADER)
		.and_then(|value| value.to_str().ok())
		.and_then(|value| value.parse::<u32>().ok())
		.unwrap_or(1);

	let response = ws
		.protocols([proto::PROTOCOL])
		.on_upgrade(move |socket| async move {
			services
				.websocket
				.handle_socket(appservice, version, process_id, socket)
				.await;
		});

	Ok(response)
}
