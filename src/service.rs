use cached::Cached;

use crate::error::Error;
use crate::models::{Playlist, Session};
use crate::sessions::SessionStore;
use crate::{crypto, spotify, CONFIG, LOG, ONE_TIME_TOKENS};

const SESSION_COOKIE: &str = "sid";

// `playlist-read-private` is what actually gates /me/playlists
const SPOTIFY_SCOPES: &str = "user-read-private user-read-email playlist-read-private";

macro_rules! resp {
    (json => $body:expr) => {{
        let mut resp = tide::Response::new(200);
        resp.set_body(tide::Body::from_json(&$body)?);
        resp
    }};
    (html => $body:expr) => {{
        tide::Response::builder(200)
            .content_type(tide::http::mime::HTML)
            .body($body)
            .build()
    }};
    (status => $status:expr, message => $msg:expr) => {{
        tide::Response::builder($status)
            .body(serde_json::json!({ "error": $msg }))
            .build()
    }};
}

#[derive(Clone)]
pub struct Context {
    sessions: SessionStore,
}

pub async fn start(sessions: SessionStore) -> tide::Result<()> {
    let ctx = Context { sessions };
    let mut app = tide::with_state(ctx);
    app.at("/").get(index);
    app.at("/status").get(status);
    app.at("/login").get(login);
    app.at("/callback").get(auth_callback);
    app.at("/playlists").get(playlists);
    app.with(tide::log::LogMiddleware::new());

    slog::info!(LOG, "running at {}", CONFIG.host());
    app.listen(CONFIG.host()).await?;
    Ok(())
}

async fn index(req: tide::Request<Context>) -> tide::Result {
    let handle = load_or_create_session(&req).await;
    let mut resp = resp!(html => render_landing());
    apply_session_cookie(&mut resp, &handle);
    Ok(resp)
}

#[derive(serde::Serialize)]
struct Status<'a> {
    ok: &'a str,
    version: &'a str,
}

async fn status(_req: tide::Request<Context>) -> tide::Result {
    Ok(resp!(json => Status {
        ok: "ok",
        version: &CONFIG.version
    }))
}

#[derive(serde::Deserialize)]
struct MaybeRedirect {
    redirect: Option<String>,
}

/// The login process sends the user to spotify to authenticate, which
/// then redirects back to our callback url with a code we can exchange
/// for api tokens. Building the redirect cannot fail locally.
async fn login(req: tide::Request<Context>) -> tide::Result {
    let maybe_redirect: MaybeRedirect = req.query()?;
    let state = new_one_time_login_token(maybe_redirect.redirect.clone()).await?;
    slog::info!(
        LOG,
        "redirecting to spotify auth with state token {}, post-login redirect {:?}",
        state,
        maybe_redirect.redirect,
    );
    Ok(tide::Redirect::new(spotify::authorize_url(
        &CONFIG.spotify_auth_url,
        &CONFIG.spotify_client_id,
        &CONFIG.spotify_redirect_url(),
        SPOTIFY_SCOPES,
        &state,
        CONFIG.force_consent,
    ))
    .into())
}

#[derive(Debug, serde::Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

/// After we redirect users to spotify to log in, spotify sends them
/// back here. A successful consent carries `code` and the `state` we
/// minted in `login`; a declined consent carries `error` instead of
/// `code`. This handler is the single transition from unauthenticated
/// to authenticated.
async fn auth_callback(req: tide::Request<Context>) -> tide::Result {
    slog::info!(LOG, "got login redirect");
    let query: CallbackQuery = req.query()?;
    let handle = load_or_create_session(&req).await;
    let store = req.state().sessions.clone();
    match handle_callback(&store, handle, query).await {
        Ok(resp) => Ok(resp),
        Err(e) => Ok(e.into_response()),
    }
}

async fn handle_callback(
    store: &SessionStore,
    mut handle: SessionHandle,
    query: CallbackQuery,
) -> Result<tide::Response, Error> {
    let login_token = match query.state {
        Some(ref s) => consume_one_time_login_token(s).await,
        None => None,
    };
    let login_token = match login_token {
        Some(t) => t,
        None => {
            slog::info!(LOG, "rejecting callback with missing or invalid state token");
            return Ok(resp!(status => 400, message => "invalid or expired login state"));
        }
    };

    let code = match query.code {
        Some(c) => c,
        // the user cancelled or spotify declined; the `error` query
        // parameter only goes to the log
        None => return Err(Error::AuthorizationDenied { reason: query.error }),
    };

    let grant = spotify::exchange_code(&code).await?;
    handle.session.access_token = Some(grant.access_token);
    // store the refresh token whenever spotify hands one back
    handle.session.refresh_token = grant.refresh_token;
    store.put(handle.key.clone(), handle.session.clone()).await;
    slog::info!(LOG, "completing login, session is now authenticated");

    let mut resp: tide::Response =
        tide::Redirect::new(post_login_redirect(login_token.redirect)).into();
    apply_session_cookie(&mut resp, &handle);
    Ok(resp)
}

fn post_login_redirect(redirect: Option<String>) -> String {
    match redirect {
        // never bounce a fresh login back into the login route
        Some(path) if !path.contains("login") => format!("{}{}", CONFIG.redirect_host(), path),
        _ => format!("{}/playlists", CONFIG.redirect_host()),
    }
}

async fn playlists(req: tide::Request<Context>) -> tide::Result {
    let handle = load_or_create_session(&req).await;
    let store = req.state().sessions.clone();
    match list_playlists(&store, handle).await {
        Ok(resp) => Ok(resp),
        Err(e) => Ok(e.into_response()),
    }
}

async fn list_playlists(
    store: &SessionStore,
    mut handle: SessionHandle,
) -> Result<tide::Response, Error> {
    let mut access_token = match handle.session.access_token.clone() {
        Some(t) => t,
        None => return Ok(login_redirect(&handle)),
    };

    if let Some(refreshed) = refresh_session_token(store, &handle.key, &mut handle.session).await {
        access_token = refreshed;
    }

    match spotify::fetch_playlists(&access_token).await? {
        spotify::PlaylistsFetch::Unauthorized => {
            // spotify no longer honors the token - drop both credentials
            // and send the user back through the login flow
            handle.session.clear_tokens();
            store.put(handle.key.clone(), handle.session.clone()).await;
            slog::info!(LOG, "access token rejected upstream, session demoted");
            Ok(login_redirect(&handle))
        }
        spotify::PlaylistsFetch::Page(items) => {
            let total = items.len();
            let displayable = displayable_playlists(items);
            slog::info!(
                LOG, "rendering playlists";
                "total" => total,
                "displayable" => displayable.len(),
            );
            let mut resp = resp!(html => render_playlists(&displayable));
            apply_session_cookie(&mut resp, &handle);
            Ok(resp)
        }
    }
}

/// Keep only playlists with cover art, preserving spotify's order.
fn displayable_playlists(items: Vec<Playlist>) -> Vec<Playlist> {
    items.into_iter().filter(|p| p.is_displayable()).collect()
}

/// Best-effort refresh. A missing refresh token and a failed refresh
/// both mean "no refresh possible": the current access token stays in
/// place and the next upstream 401 forces a fresh login.
async fn refresh_session_token(
    store: &SessionStore,
    key: &str,
    session: &mut Session,
) -> Option<String> {
    let refresh_token = session.refresh_token.clone()?;
    match spotify::refresh_access_token(&refresh_token).await {
        Ok(grant) => {
            session.access_token = Some(grant.access_token.clone());
            if grant.refresh_token.is_some() {
                // spotify occasionally rotates the refresh token
                session.refresh_token = grant.refresh_token;
            }
            store.put(key.to_string(), session.clone()).await;
            Some(grant.access_token)
        }
        Err(e) => {
            slog::warn!(LOG, "token refresh failed, keeping current token: {}", e);
            None
        }
    }
}

fn login_redirect(handle: &SessionHandle) -> tide::Response {
    let mut resp: tide::Response = tide::Redirect::new(format!(
        "{}/login?redirect=/playlists",
        CONFIG.redirect_host()
    ))
    .into();
    apply_session_cookie(&mut resp, handle);
    resp
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct OneTimeLoginToken {
    token: String,
    redirect: Option<String>,
}

async fn new_one_time_login_token(redirect: Option<String>) -> tide::Result<String> {
    let s = uuid::Uuid::new_v4()
        .simple()
        .encode_lower(&mut uuid::Uuid::encode_buffer())
        .to_string();
    let s = serde_json::to_string(&OneTimeLoginToken { token: s, redirect }).map_err(|e| {
        tide::Error::from_str(
            tide::StatusCode::InternalServerError,
            format!("login token encode error {}", e),
        )
    })?;
    let s = base64::encode_config(&s, base64::URL_SAFE_NO_PAD);
    let mut lock = ONE_TIME_TOKENS.lock().await;
    lock.cache_set(s.clone(), ());
    Ok(s)
}

/// Consume a state token minted by `new_one_time_login_token`. Each
/// token validates exactly once; replays and fabricated values both
/// come back `None`.
async fn consume_one_time_login_token(state: &str) -> Option<OneTimeLoginToken> {
    {
        let mut lock = ONE_TIME_TOKENS.lock().await;
        lock.cache_remove(&state.to_string())?;
    }
    let bytes = base64::decode_config(state, base64::URL_SAFE_NO_PAD).ok()?;
    let s = String::from_utf8(bytes).ok()?;
    serde_json::from_str(&s).ok()
}

struct SessionHandle {
    // hmac signature of the cookie-held session id, used as the store key
    key: String,
    // set-cookie header value when the session was minted on this request
    set_cookie: Option<String>,
    session: Session,
}

async fn load_or_create_session(req: &tide::Request<Context>) -> SessionHandle {
    let store = &req.state().sessions;
    if let Some(cookie) = req.cookie(SESSION_COOKIE) {
        let key = crypto::hmac_sign(cookie.value());
        if let Some(session) = store.get(&key).await {
            return SessionHandle {
                key,
                set_cookie: None,
                session,
            };
        }
    }
    // no cookie, or the id it carried has expired out of the store
    let sid = uuid::Uuid::new_v4()
        .simple()
        .encode_lower(&mut uuid::Uuid::encode_buffer())
        .to_string();
    let key = crypto::hmac_sign(&sid);
    let session = Session::new();
    store.put(key.clone(), session.clone()).await;
    SessionHandle {
        key,
        set_cookie: Some(session_cookie_header(&sid)),
        session,
    }
}

fn session_cookie_header(sid: &str) -> String {
    let secure = if CONFIG.ssl { "; Secure" } else { "" };
    format!(
        "{name}={sid}; Domain={domain}; HttpOnly; Max-Age={max_age}; SameSite=Lax{secure}",
        name = SESSION_COOKIE,
        sid = sid,
        domain = CONFIG.domain(),
        max_age = CONFIG.session_ttl_seconds,
        secure = secure,
    )
}

fn apply_session_cookie(resp: &mut tide::Response, handle: &SessionHandle) {
    if let Some(ref cookie) = handle.set_cookie {
        resp.insert_header("set-cookie", cookie.as_str());
    }
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn render_landing() -> String {
    "<!doctype html>\
     <html><head><title>spotshelf</title></head>\
     <body>\
     <h1>spotshelf</h1>\
     <p>See your spotify playlists in one place.</p>\
     <p><a href=\"/login\">Log in with Spotify</a></p>\
     </body></html>"
        .to_string()
}

fn render_playlists(playlists: &[Playlist]) -> String {
    let mut items = String::new();
    for p in playlists {
        let owner = p
            .owner
            .as_ref()
            .and_then(|o| o.display_name.as_deref())
            .unwrap_or("unknown");
        let cover = p
            .images
            .as_ref()
            .and_then(|i| i.first())
            .map(|img| {
                format!(
                    "<img src=\"{}\" alt=\"\" width=\"60\" height=\"60\"> ",
                    html_escape(&img.url)
                )
            })
            .unwrap_or_default();
        items.push_str(&format!(
            "<li>{cover}<strong>{name}</strong> &mdash; {owner}</li>",
            cover = cover,
            name = html_escape(&p.name),
            owner = html_escape(owner),
        ));
    }
    format!(
        "<!doctype html>\
         <html><head><title>your playlists</title></head>\
         <body>\
         <h1>Your playlists</h1>\
         <ul>{}</ul>\
         </body></html>",
        items
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PlaylistImage;

    fn playlist(id: &str, name: &str, images: Option<Vec<PlaylistImage>>) -> Playlist {
        Playlist {
            id: id.to_string(),
            name: name.to_string(),
            owner: None,
            images,
        }
    }

    fn image(url: &str) -> PlaylistImage {
        PlaylistImage {
            url: url.to_string(),
            height: None,
            width: None,
        }
    }

    #[test]
    fn filter_keeps_only_playlists_with_cover_art_in_order() {
        let items = vec![
            playlist("1", "empty images", Some(vec![])),
            playlist("2", "has cover", Some(vec![image("https://i.scdn.co/x")])),
            playlist("3", "no images field", None),
            playlist("4", "also covered", Some(vec![image("https://i.scdn.co/y")])),
        ];
        let kept = displayable_playlists(items);
        let ids: Vec<&str> = kept.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "4"]);
    }

    #[test]
    fn escaping_neutralizes_markup_in_names() {
        assert_eq!(
            html_escape("<script>alert(\"x\")</script> & more"),
            "&lt;script&gt;alert(&quot;x&quot;)&lt;/script&gt; &amp; more"
        );
    }

    #[test]
    fn rendered_page_escapes_playlist_names() {
        let page = render_playlists(&[playlist(
            "1",
            "<script>bad</script>",
            Some(vec![image("https://i.scdn.co/x")]),
        )]);
        assert!(!page.contains("<script>bad</script>"));
        assert!(page.contains("&lt;script&gt;bad&lt;/script&gt;"));
    }

    #[test]
    fn post_login_redirect_defaults_to_playlists() {
        let target = post_login_redirect(None);
        assert!(target.ends_with("/playlists"));
    }

    #[test]
    fn post_login_redirect_honors_the_requested_path() {
        let target = post_login_redirect(Some("/playlists?page=2".to_string()));
        assert!(target.ends_with("/playlists?page=2"));
    }

    #[test]
    fn post_login_redirect_never_targets_the_login_route() {
        let target = post_login_redirect(Some("/login".to_string()));
        assert!(target.ends_with("/playlists"));
    }

    #[test]
    fn session_cookie_is_http_only_and_scoped() {
        let header = session_cookie_header("abc123");
        assert!(header.starts_with("sid=abc123;"));
        assert!(header.contains("HttpOnly"));
        assert!(header.contains("SameSite=Lax"));
        assert!(header.contains("Max-Age="));
    }

    #[async_std::test]
    async fn one_time_login_token_round_trips_the_redirect() {
        let state = new_one_time_login_token(Some("/playlists".to_string()))
            .await
            .expect("token should mint");
        let token = consume_one_time_login_token(&state)
            .await
            .expect("token should validate once");
        assert_eq!(token.redirect.as_deref(), Some("/playlists"));
    }

    #[async_std::test]
    async fn one_time_login_token_cannot_be_replayed() {
        let state = new_one_time_login_token(None)
            .await
            .expect("token should mint");
        assert!(consume_one_time_login_token(&state).await.is_some());
        assert!(consume_one_time_login_token(&state).await.is_none());
    }

    #[async_std::test]
    async fn fabricated_state_tokens_are_rejected() {
        assert!(consume_one_time_login_token("not-a-minted-token")
            .await
            .is_none());
    }

    fn handle_for(session: Session) -> SessionHandle {
        SessionHandle {
            key: "test-key".to_string(),
            set_cookie: None,
            session,
        }
    }

    #[async_std::test]
    async fn playlists_without_access_token_redirects_to_login() {
        let store = SessionStore::new(60);
        let resp = list_playlists(&store, handle_for(Session::new()))
            .await
            .expect("anonymous sessions should redirect, not error");
        assert_eq!(resp.status(), tide::StatusCode::Found);
        let location = resp
            .header("location")
            .expect("redirect should carry a location header")
            .last()
            .as_str();
        assert!(location.contains("/login"));
    }

    #[async_std::test]
    async fn refresh_without_refresh_token_is_a_no_op() {
        let store = SessionStore::new(60);
        let mut session = Session::new();
        session.access_token = Some("access".to_string());
        let refreshed = refresh_session_token(&store, "test-key", &mut session).await;
        assert!(refreshed.is_none());
        assert_eq!(session.access_token.as_deref(), Some("access"));
        // nothing was written back either
        assert!(store.get("test-key").await.is_none());
    }

    #[async_std::test]
    async fn callback_without_code_is_authorization_denied() {
        let store = SessionStore::new(60);
        let state = new_one_time_login_token(None)
            .await
            .expect("token should mint");
        let query = CallbackQuery {
            code: None,
            state: Some(state),
            error: Some("access_denied".to_string()),
        };
        match handle_callback(&store, handle_for(Session::new()), query).await {
            Err(Error::AuthorizationDenied { .. }) => {}
            _ => panic!("expected authorization denied"),
        }
    }

    #[async_std::test]
    async fn callback_with_unknown_state_is_rejected_before_any_exchange() {
        let store = SessionStore::new(60);
        let query = CallbackQuery {
            code: Some("some-code".to_string()),
            state: Some("never-minted".to_string()),
            error: None,
        };
        match handle_callback(&store, handle_for(Session::new()), query).await {
            Ok(resp) => assert_eq!(resp.status(), tide::StatusCode::BadRequest),
            Err(_) => panic!("an invalid state should 400, not error"),
        }
    }
}
