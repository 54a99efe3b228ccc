use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Error kinds produced by the engine's public boundary (§7).
///
/// `BackpressureEvent`s are deliberately not a variant here — spec.md §7 is
/// explicit that they are counted, not returned (see
/// [`crate::pipeline::EngineStats`]). `SinkError`s are caught at the call
/// site and logged; they never propagate out of `emit`/`add_sink`.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("compile error: {0}")]
    CompileError(String),

    #[error("config error: {0}")]
    ConfigError(String),

    #[error("state error: {0}")]
    StateError(String),

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("toml error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("internal error: {0}")]
    InternalError(String),
}

impl EngineError {
    pub fn compile<S: Into<String>>(msg: S) -> Self {
        EngineError::CompileError(msg.into())
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        EngineError::ConfigError(msg.into())
    }

    pub fn state<S: Into<String>>(msg: S) -> Self {
        EngineError::StateError(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        EngineError::InternalError(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helper_constructors_produce_matching_variant() {
        assert!(matches!(EngineError::compile("bad sql"), EngineError::CompileError(_)));
        assert!(matches!(EngineError::state("already executing"), EngineError::StateError(_)));
    }
}
