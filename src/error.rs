/*!
Error taxonomy for the auth and playlist flows.

Every failure a handler can hit maps to exactly one variant. The
`detail` strings (including anything spotify sent back) only ever go to
the log; browsers get the status code and a generic message.
*/
use crate::LOG;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The provider declined or the user cancelled the consent screen.
    #[error("authorization denied: {reason:?}")]
    AuthorizationDenied { reason: Option<String> },

    /// The token endpoint answered with a non-success status or could
    /// not be reached at all.
    #[error("token exchange failed: {detail}")]
    TokenExchangeFailed { detail: String },

    /// The token endpoint answered 2xx but the body had no usable
    /// `access_token`.
    #[error("malformed token response: {detail}")]
    MalformedTokenResponse { detail: String },

    /// The resource api failed with something other than a 401.
    #[error("upstream request failed: {detail}")]
    UpstreamRequestFailed { detail: String },

    /// The resource api answered 2xx but the body didn't have the
    /// expected shape.
    #[error("malformed upstream response: {detail}")]
    MalformedUpstreamResponse { detail: String },
}

impl Error {
    pub fn status(&self) -> tide::StatusCode {
        match self {
            Error::AuthorizationDenied { .. } | Error::MalformedTokenResponse { .. } => {
                tide::StatusCode::BadRequest
            }
            Error::TokenExchangeFailed { .. }
            | Error::UpstreamRequestFailed { .. }
            | Error::MalformedUpstreamResponse { .. } => tide::StatusCode::InternalServerError,
        }
    }

    pub fn public_message(&self) -> &'static str {
        match self {
            Error::AuthorizationDenied { .. } => "authorization was denied or cancelled",
            Error::TokenExchangeFailed { .. } | Error::MalformedTokenResponse { .. } => {
                "login could not be completed"
            }
            Error::UpstreamRequestFailed { .. } | Error::MalformedUpstreamResponse { .. } => {
                "playlists are unavailable right now"
            }
        }
    }

    /// Log the full error internally and build the generic browser-facing
    /// response for it.
    pub fn into_response(self) -> tide::Response {
        slog::error!(
            LOG, "request failed: {}", self;
            "status" => u16::from(self.status()),
        );
        tide::Response::builder(self.status())
            .body(serde_json::json!({ "error": self.public_message() }))
            .build()
    }
}
