use std::sync::Arc;

use asmux_service::Services;
use axum::{
	extract::State,
	middleware::Next,
	response::Response,
};
use http::{Request, StatusCode};
use tracing::{debug, trace, warn};

/// Gates every request on the server still running, and logs the outcome
/// by status class.
pub(crate) async fn handle(
	State(services): State<Arc<Services>>,
	req: Request<axum::body::Body>,
	next: Next,
) -> Result<Response, StatusCode> {
	if !services.server.running() {
		warn!(
			method = %req.method(),
			uri = %req.uri(),
			"unavailable pending shutdown",
		);

		return Err(StatusCode::SERVICE_UNAVAILABLE);
	}

	let method = req.method().clone();
	let uri = req.uri().clone();
	let response = next.run(req).await;

	let status = response.status();
	if status.is_server_error() {
		warn!(%method, %uri, "{status}");
	} else if status.is_client_error() {
		debug!(%method, %uri, "{status}");
	} else {
		trace!(%method, %uri, "{status}");
	}

	Ok(response)
}
