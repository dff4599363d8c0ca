use thiserror::Error;

/// Top-level error type for the pooler. Nested enums group errors by the
/// subsystem that raised them, mirroring how each layer reports failures.
#[derive(Debug, Error)]
pub enum Error {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("tls error: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("startup error: {0}")]
    Startup(#[from] StartupError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame length {0} exceeds maximum {1}")]
    FrameTooLarge(i32, i32),

    #[error("frame length {0} is not a valid PostgreSQL frame length")]
    InvalidLength(i32),

    #[error("unknown message tag {0:?} in a sensitive position")]
    UnknownTag(char),

    #[error("malformed startup parameters")]
    BadStartupParams,

    #[error("startup is missing required parameter `{0}`")]
    MissingStartupParam(&'static str),

    #[error("unsupported startup protocol version {0:#x}")]
    UnsupportedProtocolVersion(u32),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("connection pool exhausted")]
    Exhausted,

    #[error("no pool configured for database `{database}` user `{user}`")]
    UnknownKey { database: String, user: String },

    #[error("backend connect failed: {0}")]
    Connect(String),

    #[error("backend authentication failed: {0}")]
    Auth(String),

    #[error("backend connection timed out")]
    Timeout,
}

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("client closed connection before completing startup")]
    ClientClosed,

    #[error("client requires TLS to be negotiated but {0}")]
    TlsPolicy(&'static str),

    #[error("login timed out")]
    LoginTimeout,
}
