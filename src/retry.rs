//! Support utilities for [`keen_retry`]'s retry API.

use async_openai::error::OpenAIError;
use keen_retry::RetryResult;
use reqwest::StatusCode;

/// A [`RetryResult`] with no input to hand back, and an [`anyhow::Error`].
pub type SimpleRetryResult<T> = RetryResult<(), (), T, anyhow::Error>;

/// Macro which implements `?`-like behavior for [`RetryResult`].
macro_rules! try_with_retry_result {
    ($result:expr) => {
        match $result {
            ::keen_retry::RetryResult::Ok { output, .. } => output,
            ::keen_retry::RetryResult::Transient { input, error } => {
                return ::keen_retry::RetryResult::Transient {
                    input,
                    error: From::from(error),
                };
            }
            ::keen_retry::RetryResult::Fatal { input, error } => {
                return ::keen_retry::RetryResult::Fatal {
                    input,
                    error: From::from(error),
                };
            }
        }
    };
}

// Export the macro within the crate as if it were a normal symbol.
pub(crate) use try_with_retry_result;

/// Build an [`RetryResult::Ok`] value.
pub(crate) fn retry_result_ok<T, E>(output: T) -> RetryResult<(), (), T, E> {
    RetryResult::Ok {
        reported_input: (),
        output,
    }
}

/// Build an [`RetryResult::Fatal`] value.
pub(crate) fn retry_result_fatal<T, E>(error: E) -> RetryResult<(), (), T, E> {
    RetryResult::Fatal { input: (), error }
}

/// Convert a [`Result`] into a [`SimpleRetryResult`].
pub(crate) trait IntoRetryResult<T, E> {
    /// Classify errors using `is_transient`.
    fn into_retry_result(self, is_transient: impl FnOnce(&E) -> bool)
    -> SimpleRetryResult<T>;

    /// Treat any error as fatal.
    fn into_fatal(self) -> SimpleRetryResult<T>;
}

impl<T, E> IntoRetryResult<T, E> for Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn into_retry_result(
        self,
        is_transient: impl FnOnce(&E) -> bool,
    ) -> SimpleRetryResult<T> {
        match self {
            Ok(output) => retry_result_ok(output),
            Err(error) if is_transient(&error) => RetryResult::Transient {
                input: (),
                error: error.into(),
            },
            Err(error) => retry_result_fatal(error.into()),
        }
    }

    fn into_fatal(self) -> SimpleRetryResult<T> {
        self.into_retry_result(|_| false)
    }
}

/// Is this error a known transient error?
///
/// By default, we assume errors are not transient until they've been observed
/// in the wild and shown to clear up on their own. Retrying a bad request or
/// a revoked key with exponential backoff only wastes time.
pub trait IsKnownTransient {
    /// Is this error likely to be transient?
    fn is_known_transient(&self) -> bool;
}

impl IsKnownTransient for reqwest::Error {
    fn is_known_transient(&self) -> bool {
        if let Some(status) = self.status() {
            status.is_known_transient()
        } else {
            // Connection resets, DNS hiccups and the like. `reqwest` doesn't
            // expose these in enough detail to be picky.
            self.is_timeout() || self.is_connect() || self.is_request()
        }
    }
}

impl IsKnownTransient for StatusCode {
    fn is_known_transient(&self) -> bool {
        let transient_failures = [
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::GATEWAY_TIMEOUT,
        ];
        transient_failures.contains(self)
    }
}

impl IsKnownTransient for OpenAIError {
    fn is_known_transient(&self) -> bool {
        match self {
            OpenAIError::Reqwest(err) => err.is_known_transient(),
            // Gateways report upstream status codes in the error body.
            OpenAIError::ApiError(err) => err
                .code
                .as_deref()
                .and_then(|code| code.parse::<u16>().ok())
                .and_then(|code| StatusCode::from_u16(code).ok())
                .is_some_and(|status| status.is_known_transient()),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_overload_statuses_are_transient() {
        assert!(StatusCode::TOO_MANY_REQUESTS.is_known_transient());
        assert!(StatusCode::GATEWAY_TIMEOUT.is_known_transient());
        assert!(!StatusCode::UNAUTHORIZED.is_known_transient());
        assert!(!StatusCode::BAD_REQUEST.is_known_transient());
    }

    #[test]
    fn results_are_classified() {
        let ok: Result<u8, anyhow::Error> = Ok(1);
        assert!(matches!(ok.into_fatal(), RetryResult::Ok { output: 1, .. }));

        let err: Result<u8, anyhow::Error> = Err(anyhow::anyhow!("busy"));
        assert!(matches!(
            err.into_retry_result(|e| e.to_string() == "busy"),
            RetryResult::Transient { .. }
        ));

        let err: Result<u8, anyhow::Error> = Err(anyhow::anyhow!("bad key"));
        assert!(matches!(err.into_fatal(), RetryResult::Fatal { .. }));
    }

    #[test]
    fn invalid_arguments_are_fatal() {
        let err = OpenAIError::InvalidArgument("no model".to_owned());
        assert!(!err.is_known_transient());
    }
}
