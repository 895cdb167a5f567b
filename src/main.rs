use async_mutex::Mutex;
use cached::stores::TimedCache;
use slog::o;
use slog::Drain;
use std::io::Read;
use std::sync::Arc;
use std::{env, fs};

mod crypto;
mod error;
mod models;
mod service;
mod sessions;
mod spotify;

fn env_or(k: &str, default: &str) -> String {
    env::var(k).unwrap_or_else(|_| default.to_string())
}

lazy_static::lazy_static! {
    pub static ref CONFIG: Config = Config::load();

    // The "base" logger that all modules should branch off of
    pub static ref BASE_LOG: slog::Logger = {
        let level: slog::Level = CONFIG.log_level
                .parse()
                .expect("invalid log_level");
        if CONFIG.log_format == "pretty" {
            let decorator = slog_term::TermDecorator::new().build();
            let drain = slog_term::CompactFormat::new(decorator).build().fuse();
            let drain = slog_async::Async::new(drain).build().fuse();
            let drain = slog::LevelFilter::new(drain, level).fuse();
            slog::Logger::root(drain, o!())
        } else {
            let drain = slog_json::Json::default(std::io::stderr()).fuse();
            let drain = slog_async::Async::new(drain).build().fuse();
            let drain = slog::LevelFilter::new(drain, level).fuse();
            slog::Logger::root(drain, o!())
        }
    };

    // Base logger
    pub static ref LOG: slog::Logger = BASE_LOG.new(slog::o!("app" => "spotshelf"));

    // single-use login state tokens, keyed by the state value itself.
    // entries that outlive the lifespan are treated as never issued.
    pub static ref ONE_TIME_TOKENS: Arc<Mutex<TimedCache<String, ()>>> =
        Arc::new(Mutex::new(TimedCache::with_lifespan(300)));
}

#[derive(serde::Deserialize)]
pub struct Config {
    pub version: String,
    pub ssl: bool,
    pub host: String,
    pub real_hostname: Option<String>,
    pub port: u16,
    pub log_format: String,
    pub log_level: String,
    pub spotify_client_id: String,
    pub spotify_client_secret: String,
    pub spotify_auth_url: String,
    pub spotify_token_url: String,
    pub spotify_api_base: String,
    pub spotify_redirect_override: Option<String>,
    pub session_key: String,
    pub session_ttl_seconds: u64,
    pub provider_timeout_seconds: u64,
    pub force_consent: bool,
}
impl Config {
    pub fn load() -> Self {
        let version = fs::File::open("commit_hash.txt")
            .map(|mut f| {
                let mut s = String::new();
                f.read_to_string(&mut s).expect("Error reading commit_hash");
                s
            })
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            version,
            ssl: env_or("SSL", "false") == "true",
            host: env_or("HOST", "localhost"),
            real_hostname: env::var("REAL_HOSTNAME").ok(),
            port: env_or("PORT", "3030").parse().expect("invalid port"),
            log_format: env_or("LOG_FORMAT", "json")
                .to_lowercase()
                .trim()
                .to_string(),
            log_level: env_or("LOG_LEVEL", "INFO"),
            spotify_client_id: env_or("SPOTIFY_CLIENT_ID", "fake"),
            spotify_client_secret: env_or("SPOTIFY_CLIENT_SECRET", "fake"),
            spotify_auth_url: env_or(
                "SPOTIFY_AUTH_URL",
                "https://accounts.spotify.com/authorize",
            ),
            spotify_token_url: env_or(
                "SPOTIFY_TOKEN_URL",
                "https://accounts.spotify.com/api/token",
            ),
            spotify_api_base: env_or("SPOTIFY_API_BASE", "https://api.spotify.com/v1"),
            spotify_redirect_override: env::var("SPOTIFY_REDIRECT_URL").ok(),
            session_key: env_or("SESSION_KEY", "01234567890123456789012345678901"),
            session_ttl_seconds: env_or("SESSION_TTL_SECONDS", "86400")
                .parse()
                .expect("invalid session_ttl_seconds"),
            provider_timeout_seconds: env_or("PROVIDER_TIMEOUT_SECONDS", "10")
                .parse()
                .expect("invalid provider_timeout_seconds"),
            force_consent: env_or("FORCE_CONSENT", "false") == "true",
        }
    }
    pub fn initialize(&self) -> anyhow::Result<()> {
        slog::info!(
            LOG, "initialized config";
            "version" => &CONFIG.version,
            "ssl" => &CONFIG.ssl,
            "host" => &CONFIG.host,
            "port" => &CONFIG.port,
            "log_format" => &CONFIG.log_format,
            "log_level" => &CONFIG.log_level,
            "session_ttl_seconds" => &CONFIG.session_ttl_seconds,
            "provider_timeout_seconds" => &CONFIG.provider_timeout_seconds,
        );
        Ok(())
    }
    pub fn host(&self) -> String {
        let p = if self.ssl { "https" } else { "http" };
        format!("{}://{}:{}", p, self.host, self.port)
    }
    pub fn redirect_host(&self) -> String {
        self.real_hostname.clone().unwrap_or_else(|| self.host())
    }
    pub fn spotify_redirect_url(&self) -> String {
        self.spotify_redirect_override
            .clone()
            .unwrap_or_else(|| format!("{}/callback", self.redirect_host()))
    }
    pub fn domain(&self) -> String {
        self.host.clone()
    }
}

#[async_std::main]
async fn main() -> tide::Result<()> {
    // try sourcing a .env if one exists
    dotenv::dotenv().ok();
    CONFIG.initialize()?;

    let sessions = sessions::SessionStore::new(CONFIG.session_ttl_seconds);
    service::start(sessions).await?;
    Ok(())
}
