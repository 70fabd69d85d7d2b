use std::fmt::Debug;
use std::path::PathBuf;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use sha2::{Digest, Sha256};

use crate::codec::RasterFormat;
use crate::error::{ProcessError, ProcessResult};

/// Where the bytes of a processing request come from.
#[derive(Clone, PartialEq, Eq)]
pub enum ImageInput {
    Path(PathBuf),
    /// `data:<mime>;base64,<payload>`; the payload is kept encoded until read.
    DataUri { mime: String, payload: String },
}

impl Debug for ImageInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageInput::Path(p) => f.debug_tuple("Path").field(p).finish(),
            ImageInput::DataUri { mime, payload } => f
                .debug_struct("DataUri")
                .field("mime", mime)
                .field("payload_len", &payload.len())
                .finish(),
        }
    }
}

impl ImageInput {
    pub fn parse(input: &str) -> ProcessResult<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(ProcessError::InvalidSource("empty source".into()));
        }
        let Some(rest) = input.strip_prefix("data:") else {
            return Ok(ImageInput::Path(PathBuf::from(input)));
        };
        let (header, payload) = rest
            .split_once(',')
            .ok_or_else(|| ProcessError::InvalidSource("data uri without ','".into()))?;
        let Some(mime) = header.strip_suffix(";base64") else {
            return Err(ProcessError::InvalidSource(format!(
                "data uri is not base64: {header}"
            )));
        };
        if !mime.starts_with("image/") {
            return Err(ProcessError::InvalidSource(format!(
                "data uri is not an image: {mime}"
            )));
        }
        Ok(ImageInput::DataUri {
            mime: mime.to_string(),
            payload: payload.to_string(),
        })
    }

    /// Stable identity used in cache keys.
    pub fn identity(&self) -> String {
        match self {
            ImageInput::Path(p) => p.to_string_lossy().into_owned(),
            ImageInput::DataUri { payload, .. } => {
                let digest = hex::encode(Sha256::digest(payload.as_bytes()));
                format!("data-{}", &digest[..16])
            }
        }
    }

    pub async fn read(&self) -> ProcessResult<Vec<u8>> {
        match self {
            ImageInput::Path(p) => tokio::fs::read(p)
                .await
                .map_err(|e| ProcessError::SourceRead(format!("{}: {e}", p.display()))),
            ImageInput::DataUri { payload, .. } => STANDARD
                .decode(payload.as_bytes())
                .map_err(|e| ProcessError::SourceRead(format!("base64: {e}"))),
        }
    }
}

/// `data:image/<fmt>;base64,...` for encoded output; `None` for `Unknown`.
pub fn to_data_uri(format: RasterFormat, bytes: &[u8]) -> Option<String> {
    let mime = format.mime()?;
    Some(format!("data:{};base64,{}", mime.essence_str(), STANDARD.encode(bytes)))
}
