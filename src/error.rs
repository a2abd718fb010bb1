use thiserror::Error;

#[derive(Error, Debug)]
pub enum BalancerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Inventory error: {0}")]
    Inventory(String),

    #[error("Placement error: {0}")]
    Placement(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Timeout: {0}")]
    Timeout(String),
}

impl BalancerError {
    /// Process exit code for this error class.
    ///
    /// 0 = success, 1 = cycle failure, 2 = invalid configuration,
    /// 3 = authentication rejected by the API.
    pub fn exit_code(&self) -> i32 {
        match self {
            BalancerError::Config(_) => 2,
            BalancerError::Auth(_) => 3,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, BalancerError>;

// Error conversions for common error types

impl From<serde_json::Error> for BalancerError {
    fn from(e: serde_json::Error) -> Self {
        BalancerError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for BalancerError {
    fn from(e: serde_yaml::Error) -> Self {
        BalancerError::Config(e.to_string())
    }
}

impl From<reqwest::Error> for BalancerError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            BalancerError::Timeout(e.to_string())
        } else {
            BalancerError::Transport(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(BalancerError::Config("bad".into()).exit_code(), 2);
        assert_eq!(BalancerError::Auth("denied".into()).exit_code(), 3);
        assert_eq!(BalancerError::Transport("down".into()).exit_code(), 1);
        assert_eq!(BalancerError::Inventory("broken".into()).exit_code(), 1);
    }
}
