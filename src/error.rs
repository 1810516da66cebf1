pub type LabelkitResult<T> = Result<T, LabelkitError>;

#[derive(thiserror::Error, Debug)]
pub enum LabelkitError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("mapping error: {0}")]
    Mapping(String),

    #[error("resolution error: {0}")]
    Resolution(String),

    #[error("raster error: {0}")]
    Raster(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LabelkitError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn mapping(msg: impl Into<String>) -> Self {
        Self::Mapping(msg.into())
    }

    pub fn resolution(msg: impl Into<String>) -> Self {
        Self::Resolution(msg.into())
    }

    pub fn raster(msg: impl Into<String>) -> Self {
        Self::Raster(msg.into())
    }
}
