//! Inline error construction. `err!` builds an [`Error`](crate::Error);
//! `Err!` wraps it for early returns.
//!
//! ```ignore
//! return Err!(Request(FORBIDDEN, "Incorrect access token"));
//! let e = err!(Config("database", "{path} is not a postgres url"));
//! ```

#[macro_export]
macro_rules! err {
	(Config($item:literal, $($args:tt)+)) => {
		$crate::Error::Config($item, ::std::format!($($args)+).into())
	};

	(Request($code:ident, $($args:tt)+)) => {
		$crate::Error::Request(
			$crate::http::StatusCode::$code,
			::std::format!($($args)+).into(),
		)
	};

	($($args:tt)+) => {
		$crate::Error::Err(::std::format!($($args)+).into())
	};
}

#[macro_export]
macro_rules! Err {
	($($args:tt)+) => {
		Err($crate::err!($($args)+))
	};
}
