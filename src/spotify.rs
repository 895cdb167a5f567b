/*!
Spotify client: authorize-url construction, the two token grants, and
the playlists fetch.

The network functions are thin wrappers over the pure parse helpers so
the interesting behavior stays testable without a live provider. Every
provider call is bounded by the configured timeout; there are no
retries anywhere.
*/
use std::time::Duration;

use crate::error::Error;
use crate::models::{Playlist, PlaylistsPage};
use crate::CONFIG;

#[derive(Debug)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

// the token endpoint also reports token_type, scope and expires_in;
// none of them are consumed, expiry is discovered via downstream 401s
#[derive(serde::Deserialize, Debug)]
struct RawTokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
}

#[derive(serde::Serialize)]
struct AccessParams {
    grant_type: String,
    code: String,
    redirect_uri: String,
    client_id: String,
    client_secret: String,
}
impl AccessParams {
    fn from_code(code: &str) -> Self {
        AccessParams {
            grant_type: "authorization_code".to_string(),
            code: code.to_string(),
            redirect_uri: CONFIG.spotify_redirect_url(),
            client_id: CONFIG.spotify_client_id.clone(),
            client_secret: CONFIG.spotify_client_secret.clone(),
        }
    }
}

#[derive(serde::Serialize)]
struct RefreshParams {
    grant_type: String,
    refresh_token: String,
    client_id: String,
    client_secret: String,
}
impl RefreshParams {
    fn from_token(token: &str) -> Self {
        RefreshParams {
            grant_type: "refresh_token".to_string(),
            refresh_token: token.to_string(),
            client_id: CONFIG.spotify_client_id.clone(),
            client_secret: CONFIG.spotify_client_secret.clone(),
        }
    }
}

/// Build the url we send browsers to for the consent screen. All
/// parameter values are percent-encoded; `show_dialog` is only appended
/// when re-consent is being forced.
pub fn authorize_url(
    auth_endpoint: &str,
    client_id: &str,
    redirect_uri: &str,
    scope: &str,
    state: &str,
    force_consent: bool,
) -> String {
    let mut url = format!(
        "{endpoint}?client_id={id}&response_type=code&redirect_uri={redirect}&scope={scope}&state={state}",
        endpoint = auth_endpoint,
        id = urlencoding::encode(client_id),
        redirect = urlencoding::encode(redirect_uri),
        scope = urlencoding::encode(scope),
        state = urlencoding::encode(state),
    );
    if force_consent {
        url.push_str("&show_dialog=true");
    }
    url
}

fn provider_timeout() -> Duration {
    Duration::from_secs(CONFIG.provider_timeout_seconds)
}

async fn token_request<P: serde::Serialize>(params: &P) -> Result<(surf::StatusCode, String), Error> {
    let form = surf::Body::from_form(params).map_err(|e| Error::TokenExchangeFailed {
        detail: format!("form encode error: {}", e),
    })?;
    let fut = async move {
        let mut resp = surf::post(&CONFIG.spotify_token_url)
            .body(form)
            .send()
            .await
            .map_err(|e| Error::TokenExchangeFailed {
                detail: format!("token endpoint request error: {}", e),
            })?;
        let status = resp.status();
        let body = resp
            .body_string()
            .await
            .map_err(|e| Error::TokenExchangeFailed {
                detail: format!("token endpoint read error: {}", e),
            })?;
        Ok((status, body))
    };
    match async_std::future::timeout(provider_timeout(), fut).await {
        Ok(res) => res,
        Err(_) => Err(Error::TokenExchangeFailed {
            detail: "token endpoint request timed out".to_string(),
        }),
    }
}

/// Exchange an authorization code for tokens.
pub async fn exchange_code(code: &str) -> Result<TokenGrant, Error> {
    let (status, body) = token_request(&AccessParams::from_code(code)).await?;
    if !status.is_success() {
        return Err(Error::TokenExchangeFailed {
            detail: format!("token endpoint returned {}: {}", status, body),
        });
    }
    parse_token_response(&body)
}

/// Trade a refresh token for a fresh access token. Callers treat any
/// error here as "no refresh possible" and carry on with the token they
/// already have.
pub async fn refresh_access_token(refresh_token: &str) -> Result<TokenGrant, Error> {
    let (status, body) = token_request(&RefreshParams::from_token(refresh_token)).await?;
    if !status.is_success() {
        return Err(Error::TokenExchangeFailed {
            detail: format!("token refresh returned {}: {}", status, body),
        });
    }
    parse_token_response(&body)
}

pub enum PlaylistsFetch {
    /// The playlist items, in the order spotify returned them.
    Page(Vec<Playlist>),
    /// Spotify no longer honors the access token.
    Unauthorized,
}

/// Fetch the current user's playlists with a bearer token.
pub async fn fetch_playlists(access_token: &str) -> Result<PlaylistsFetch, Error> {
    let url = format!("{}/me/playlists", CONFIG.spotify_api_base);
    let bearer = format!("Bearer {}", access_token);
    let fut = async move {
        let mut resp = surf::get(&url)
            .header("authorization", bearer)
            .send()
            .await
            .map_err(|e| Error::UpstreamRequestFailed {
                detail: format!("playlists request error: {}", e),
            })?;
        let status = resp.status();
        let body = resp
            .body_string()
            .await
            .map_err(|e| Error::UpstreamRequestFailed {
                detail: format!("playlists read error: {}", e),
            })?;
        Ok((status, body))
    };
    let (status, body) = match async_std::future::timeout(provider_timeout(), fut).await {
        Ok(res) => res?,
        Err(_) => {
            return Err(Error::UpstreamRequestFailed {
                detail: "playlists request timed out".to_string(),
            })
        }
    };
    if status == surf::StatusCode::Unauthorized {
        return Ok(PlaylistsFetch::Unauthorized);
    }
    if !status.is_success() {
        return Err(Error::UpstreamRequestFailed {
            detail: format!("playlists endpoint returned {}: {}", status, body),
        });
    }
    Ok(PlaylistsFetch::Page(parse_playlists_body(&body)?))
}

pub fn parse_token_response(body: &str) -> Result<TokenGrant, Error> {
    let raw: RawTokenResponse =
        serde_json::from_str(body).map_err(|e| Error::MalformedTokenResponse {
            detail: format!("token response is not json: {}", e),
        })?;
    let access_token = raw.access_token.ok_or_else(|| Error::MalformedTokenResponse {
        detail: "token response has no access_token".to_string(),
    })?;
    Ok(TokenGrant {
        access_token,
        refresh_token: raw.refresh_token,
    })
}

pub fn parse_playlists_body(body: &str) -> Result<Vec<Playlist>, Error> {
    let page: PlaylistsPage =
        serde_json::from_str(body).map_err(|e| Error::MalformedUpstreamResponse {
            detail: format!("playlists response has unexpected shape: {}", e),
        })?;
    Ok(page.items)
}
