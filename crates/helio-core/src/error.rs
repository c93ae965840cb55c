use thiserror::Error;

#[derive(Error, Debug)]
pub enum HelioError {
    #[error("GPU device error: {0}")]
    GpuDeviceError(String),

    #[error("Rendering context error: {0}")]
    ContextError(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),
}

pub type Result<T> = std::result::Result<T, HelioError>;
