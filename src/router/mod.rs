mod request;
mod serve;

use std::sync::Arc;

use asmux_core::Result;
use asmux_service::Services;
use axum::{Router, middleware};
use http::header::AUTHORIZATION;
use tower_http::{
	sensitive_headers::SetSensitiveHeadersLayer,
	trace::TraceLayer,
};

/// Builds the full middleware stack around the api routes and serves it
/// until shutdown.
pub async fn serve(services: &Arc<Services>) -> Result {
	let router = build(services);
	let addr = services.server.config.listen_addr()?;

	serve::serve(services, router, addr).await
}

fn build(services: &Arc<Services>) -> Router {
	asmux_api::router(services)
		.layer(middleware::from_fn_with_state(services.clone(), request::handle))
		.layer(TraceLayer::new_for_http())
		.layer(SetSensitiveHeadersLayer::new([AUTHORIZATION]))
}
