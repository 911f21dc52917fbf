use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("{name} < 1: {value}")]
    InvalidLimit { name: &'static str, value: usize },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("No tokio runtime available")]
    NoRuntime,
}

pub type Result<T> = std::result::Result<T, DispatchError>;
