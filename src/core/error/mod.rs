mod err;
mod response;

use std::borrow::Cow;

#[derive(thiserror::Error)]
pub enum Error {
	// std
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
	#[error(transparent)]
	Utf8(#[from] std::str::Utf8Error),

	// third-party
	#[error(transparent)]
	Figment(#[from] figment::error::Error),
	#[error(transparent)]
	Http(#[from] http::Error),
	#[error(transparent)]
	HttpHeader(#[from] http::header::InvalidHeaderValue),
	#[error("Join error: {0}")]
	JoinError(#[from] tokio::task::JoinError),
	#[error(transparent)]
	Json(#[from] serde_json::Error),
	#[error(transparent)]
	Mxid(#[from] ruma::IdParseError),
	#[error(transparent)]
	Prometheus(#[from] prometheus::Error),
	#[error("Redis error: {0}")]
	Redis(#[from] redis::RedisError),
	#[error("Request error: {0}")]
	Reqwest(#[from] reqwest::Error),
	#[error("Database error: {0}")]
	Sqlx(#[from] sqlx::Error),
	#[error(transparent)]
	Url(#[from] url::ParseError),
	#[error(transparent)]
	Uuid(#[from] uuid::Error),
	#[error(transparent)]
	Yaml(#[from] serde_yaml::Error),

	// asmux
	#[error("There was a problem with the '{0}' directive in your configuration: {1}")]
	Config(&'static str, Cow<'static, str>),
	#[error("{0}")]
	Database(Cow<'static, str>),
	#[error("{1}")]
	Request(http::StatusCode, Cow<'static, str>),

	// unique / untyped
	#[error("{0}")]
	Err(Cow<'static, str>),
}

impl Error {
	/// Generate the error message string.
	pub fn message(&self) -> String { format!("{self}") }

	/// Sanitizes public-facing errors that can leak sensitive information.
	pub fn sanitized_message(&self) -> String {
		match self {
			| Self::Database(..) | Self::Sqlx(..) => String::from("Database error occurred."),
			| Self::Io(..) => String::from("I/O error occurred."),
			| _ => self.message(),
		}
	}

	/// Returns the HTTP error code or closest approximation based on error
	/// variant.
	pub fn status_code(&self) -> http::StatusCode {
		use http::StatusCode;

		match self {
			| Self::Request(code, _) => *code,
			| Self::Mxid(..) | Self::Json(..) => StatusCode::BAD_REQUEST,
			| Self::Reqwest(error) => error
				.status()
				.unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
			| _ => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}

	/// Returns the Matrix error code for the response body.
	pub fn errcode(&self) -> &'static str {
		use http::StatusCode;

		match self.status_code() {
			| StatusCode::UNAUTHORIZED => "M_UNKNOWN_TOKEN",
			| StatusCode::FORBIDDEN => "M_FORBIDDEN",
			| StatusCode::NOT_FOUND => "M_NOT_FOUND",
			| StatusCode::BAD_REQUEST => "M_BAD_JSON",
			| StatusCode::TOO_MANY_REQUESTS => "M_LIMIT_EXCEEDED",
			| _ => "M_UNKNOWN",
		}
	}
}

impl std::fmt::Debug for Error {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.message())
	}
}
