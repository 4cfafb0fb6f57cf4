use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub relay: RelayClientConfig,
    pub relay_server: RelayServerConfig,
    pub jwt: JwtConfig,
    pub messaging: MessagingConfig,
    pub security: SecurityConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub environment: String,
    pub body_limit_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub ssl_mode: String,
    pub max_connections: u32,
}

/// Outbound link from the application server to the relay process.
#[derive(Debug, Clone)]
pub struct RelayClientConfig {
    pub url: String,
    pub queue_capacity: usize,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
}

/// Listener settings for the relay binary.
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    pub host: String,
    pub port: u16,
    pub allowed_origin: Option<String>,
    pub peer_queue_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub secret: String,
    pub token_ttl: Duration,
    pub issuer: String,
}

#[derive(Debug, Clone)]
pub struct MessagingConfig {
    pub default_page_size: i64,
    pub max_page_size: i64,
    pub max_recipients: usize,
}

#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub bcrypt_cost: u32,
}

impl Config {
    pub fn load() -> Self {
        dotenvy::dotenv().ok();

        Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: parse_env("SERVER_PORT", 8080),
                environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
                body_limit_bytes: parse_env("SERVER_BODY_LIMIT", 64 * 1024),
            },
            database: DatabaseConfig {
                host: env::var("DB_HOST").unwrap_or_else(|_| "localhost".to_string()),
                port: parse_env("DB_PORT", 5432),
                user: env::var("DB_USER").unwrap_or_else(|_| "postgres".to_string()),
                password: env::var("DB_PASSWORD").unwrap_or_else(|_| "postgres".to_string()),
                database: env::var("DB_NAME").unwrap_or_else(|_| "murmur".to_string()),
                ssl_mode: env::var("DB_SSL_MODE").unwrap_or_else(|_| "disable".to_string()),
                max_connections: parse_env("DB_MAX_CONNS", 25),
            },
            relay: RelayClientConfig {
                url: env::var("RELAY_URL").unwrap_or_else(|_| "ws://localhost:4000/ws".to_string()),
                queue_capacity: parse_env("RELAY_QUEUE_CAPACITY", 1024),
                reconnect_base_delay: Duration::from_millis(parse_env(
                    "RELAY_RECONNECT_BASE_MS",
                    250,
                )),
                reconnect_max_delay: Duration::from_millis(parse_env(
                    "RELAY_RECONNECT_MAX_MS",
                    10_000,
                )),
            },
            relay_server: RelayServerConfig {
                host: env::var("WS_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: parse_env("WS_PORT", 4000),
                allowed_origin: env::var("WS_ORIGIN").ok(),
                peer_queue_capacity: parse_env("WS_PEER_QUEUE", 256),
            },
            jwt: JwtConfig {
                secret: env::var("JWT_SECRET")
                    .unwrap_or_else(|_| "super-secret-jwt-key-change-in-production".to_string()),
                token_ttl: Duration::from_secs(parse_env("JWT_TOKEN_TTL", 12 * 60 * 60)), // 12 hours
                issuer: env::var("JWT_ISSUER").unwrap_or_else(|_| "murmur".to_string()),
            },
            messaging: MessagingConfig {
                default_page_size: parse_env("MESSAGES_PAGE_SIZE", 50),
                max_page_size: parse_env("MESSAGES_MAX_PAGE_SIZE", 200),
                max_recipients: parse_env("MESSAGES_MAX_RECIPIENTS", 100),
            },
            security: SecurityConfig {
                bcrypt_cost: parse_env("BCRYPT_COST", bcrypt::DEFAULT_COST),
            },
        }
    }

    pub fn database_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            self.database.user,
            self.database.password,
            self.database.host,
            self.database.port,
            self.database.database,
            self.database.ssl_mode
        )
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
