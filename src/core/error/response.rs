use axum::{
	Json,
	response::{IntoResponse, Response},
};
use serde_json::json;

use super::Error;

impl IntoResponse for Error {
	fn into_response(self) -> Response {
		let status = self.status_code();
		if status.is_server_error() {
			crate::error!("{self:?}");
		}

		let body = Json(json!({
			"errcode": self.errcode(),
			"error": self.sanitized_message(),
		}));

		(status, body).into_response()
	}
}
