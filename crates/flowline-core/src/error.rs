use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowlineError {
    // Run errors
    #[error("Input validation failed: {0}")]
    InputValidation(String),

    #[error("Step execution failed: {step}: {message}")]
    UnitExecution { step: String, message: String },

    #[error("Orchestration error: {0}")]
    WorkflowExecution(String),

    #[error("Invalid workflow composition: {0}")]
    InvalidComposition(String),

    #[error("Background execution failed: {0}")]
    BackgroundExecution(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("No session loaded for run")]
    SessionNotSet,

    // Event delivery errors
    #[error("Event handler error: {0}")]
    EventHandler(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FlowlineError {
    /// True for errors raised before any step was scheduled.
    pub fn is_validation(&self) -> bool {
        matches!(self, FlowlineError::InputValidation(_))
    }
}

pub type Result<T> = std::result::Result<T, FlowlineError>;
