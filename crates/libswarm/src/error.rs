use thiserror::Error;

#[derive(Debug, Error)]
pub enum SwarmError {
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("port mapping error: {0}")]
    PortMapping(String),
    #[error("transport is closing")]
    Closing,
}
