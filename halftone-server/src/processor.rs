use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use crate::cache::{CacheStore, FsCacheStore, MemoryCacheStore, cache_key};
use crate::codec::{self, RasterFormat};
use crate::config::{Config, FilterAdjustments};
use crate::dither::DitherType;
use crate::error::{ProcessError, ProcessResult};
use crate::pipeline::{self, PipelineContext};
use crate::resample::{DEFAULT_DITHER_PIXEL_BUDGET, resolve_backend};
use crate::scheduler::{ChunkConfig, ChunkScheduler};
use crate::sources::{ImageInput, to_data_uri};

pub const DEFAULT_JPEG_QUALITY: u8 = 90;
pub const DEFAULT_CACHE_DIR: &str = "cache";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Processed,
    Cached,
    /// Processing failed and the input was handed back unchanged.
    Fallback,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessOutput {
    pub output: String,
    pub outcome: Outcome,
}

pub struct Processor {
    cache: Arc<dyn CacheStore>,
    ctx: PipelineContext,
    jpeg_quality: u8,
}

impl Processor {
    pub fn new(cache: Arc<dyn CacheStore>, ctx: PipelineContext, jpeg_quality: u8) -> Self {
        Self {
            cache,
            ctx,
            jpeg_quality: jpeg_quality.clamp(1, 100),
        }
    }

    /// Build from the typed config. The resampling backend is resolved here, once.
    pub fn from_config(cfg: &Config) -> Self {
        let processing = cfg.processing.as_ref();
        let backend = resolve_backend(processing.and_then(|p| p.backend).unwrap_or_default());
        let ctx = PipelineContext {
            scheduler: ChunkScheduler::new(ChunkConfig::from_processing(processing)),
            backend,
            max_dither_pixels: processing
                .and_then(|p| p.max_dither_pixels)
                .unwrap_or(DEFAULT_DITHER_PIXEL_BUDGET),
        };
        let jpeg_quality = processing
            .and_then(|p| p.jpeg_quality)
            .unwrap_or(DEFAULT_JPEG_QUALITY);

        let cache_cfg = cfg.cache.clone().unwrap_or_default();
        let cache: Arc<dyn CacheStore> = if cache_cfg.enabled.unwrap_or(true) {
            let dir = cache_cfg
                .dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR));
            let store = FsCacheStore::new(dir);
            tracing::info!(dir = %store.dir().display(), "using on-disk output cache");
            Arc::new(store)
        } else {
            tracing::info!("on-disk cache disabled; caching in memory");
            Arc::new(MemoryCacheStore::new())
        };
        tracing::info!(
            backend = ?ctx.backend,
            max_workers = ctx.scheduler.config().max_workers,
            max_dither_pixels = ctx.max_dither_pixels,
            jpeg_quality,
            "processor ready"
        );
        Self::new(cache, ctx, jpeg_quality)
    }

    /// Process `source` into a `data:` URI.
    ///
    /// Never fails: on any processing error the original `source` string is
    /// returned with [`Outcome::Fallback`].
    pub async fn process(
        &self,
        source: &str,
        adjustments: &FilterAdjustments,
        dither: Option<DitherType>,
    ) -> ProcessOutput {
        let started = Instant::now();
        match self.try_process(source, adjustments, dither).await {
            Ok((output, outcome)) => {
                tracing::debug!(
                    outcome = ?outcome,
                    dither = ?dither,
                    elapsed_ms = started.elapsed().as_millis(),
                    "processed image"
                );
                ProcessOutput { output, outcome }
            }
            Err(e) => {
                tracing::warn!(error = %e, dither = ?dither, "processing failed; returning original input");
                ProcessOutput {
                    output: source.to_string(),
                    outcome: Outcome::Fallback,
                }
            }
        }
    }

    async fn try_process(
        &self,
        source: &str,
        adjustments: &FilterAdjustments,
        dither: Option<DitherType>,
    ) -> ProcessResult<(String, Outcome)> {
        let input = ImageInput::parse(source)?;
        let adj = adjustments.clamped();

        let key = dither.map(|d| cache_key(&input.identity(), d, adj.luminance_threshold));
        if let Some(key) = &key {
            match self.cache.get(key).await {
                Ok(Some(bytes)) => {
                    let format = codec::detect_format(&bytes);
                    if let Some(uri) = to_data_uri(format, &bytes) {
                        tracing::debug!(key = %key, "cache hit");
                        return Ok((uri, Outcome::Cached));
                    }
                    tracing::warn!(key = %key, "cache entry has unknown format; ignoring");
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(key = %key, error = %e, "cache read failed"),
            }
        }

        let bytes = input.read().await?;
        let format = codec::detect_format(&bytes);
        if format == RasterFormat::Unknown {
            return Err(ProcessError::UnsupportedFormat);
        }
        let image = codec::decode(&bytes, format)?;
        tracing::debug!(width = image.width, height = image.height, format = ?format, "decoded source");

        let image = pipeline::run(image, &adj, dither, &self.ctx).await?;
        let encoded = codec::encode(&image, format, self.jpeg_quality)?;

        if let Some(key) = &key
            && let Err(e) = self.cache.put(key, &encoded).await
        {
            tracing::warn!(key = %key, error = %e, "cache write failed");
        }
        let uri = to_data_uri(format, &encoded).ok_or(ProcessError::UnsupportedFormat)?;
        Ok((uri, Outcome::Processed))
    }
}
