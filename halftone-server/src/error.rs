use thiserror::Error;

/// Failures raised inside a processing run.
///
/// None of these reach the caller of [`crate::processor::Processor::process`];
/// the processor logs them and hands back the original input instead.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("unsupported image format")]
    UnsupportedFormat,

    #[error("decode error: {0}")]
    Decode(String),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("source read error: {0}")]
    SourceRead(String),

    #[error("invalid source: {0}")]
    InvalidSource(String),
}

impl From<image::ImageError> for ProcessError {
    fn from(e: image::ImageError) -> Self {
        ProcessError::Decode(e.to_string())
    }
}

pub type ProcessResult<T> = std::result::Result<T, ProcessError>;
