use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to read config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid client config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("connection manager has shut down")]
    Closed,
}
