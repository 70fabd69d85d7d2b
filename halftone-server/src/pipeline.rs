//! Raster stage ordering for one processing run.
//!
//! scale -> tone -> blur -> (budget downscale -> dither). The tone pass and
//! the dither pass are driven through the [`ChunkScheduler`]; everything else
//! runs as a single unit.

use crate::blur::box_blur;
use crate::codec::RasterImage;
use crate::config::{FilterAdjustments, ResampleBackend};
use crate::dither::{
    DitherType, OrderedThresholds, diffuse_rows, grayscale, halftone_rows, ordered_range,
    threshold_range,
};
use crate::error::ProcessResult;
use crate::resample::{fit_pixel_budget, scale_by};
use crate::scheduler::{ChunkReport, ChunkScheduler, split_ranges};
use crate::tone::LookupTables;

/// Run-independent knobs for the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub scheduler: ChunkScheduler,
    pub backend: ResampleBackend,
    pub max_dither_pixels: usize,
}

/// Apply `adj` and, when requested, `dither` to a decoded image.
///
/// `adj` is expected to be clamped already.
pub async fn run(
    image: RasterImage,
    adj: &FilterAdjustments,
    dither: Option<DitherType>,
    ctx: &PipelineContext,
) -> ProcessResult<RasterImage> {
    let mut image = scale_by(image, adj.scale, ctx.backend)?;

    let tables = LookupTables::new(adj);
    if !tables.is_identity() {
        let report = ctx
            .scheduler
            .run_pixel_ranges(&mut image.pixels, |(_, range)| tables.apply(range))
            .await;
        log_report("tone", &report);
    }

    if adj.blur > 0.0 {
        image = box_blur(image, adj.blur);
        ctx.scheduler.yield_point().await;
    }

    let Some(kind) = dither else {
        return Ok(image);
    };
    let mut image = fit_pixel_budget(image, ctx.max_dither_pixels);
    let report = dither_chunked(&mut image, kind, adj.luminance_threshold, &ctx.scheduler).await;
    log_report(kind.as_str(), &report);
    Ok(image)
}

async fn dither_chunked(
    image: &mut RasterImage,
    kind: DitherType,
    threshold: f32,
    scheduler: &ChunkScheduler,
) -> ChunkReport {
    let width = image.width as usize;
    let height = image.height as usize;
    let cfg = *scheduler.config();
    match kind {
        DitherType::None => {
            scheduler
                .run_pixel_ranges(&mut image.pixels, |(_, range)| threshold_range(range, threshold))
                .await
        }
        DitherType::Ordered | DitherType::Bayer2x2 | DitherType::Bayer4x4 => {
            let Some(cells) = OrderedThresholds::new(kind, threshold) else {
                return ChunkReport {
                    units: 0,
                    elapsed: Default::default(),
                };
            };
            scheduler
                .run_pixel_ranges(&mut image.pixels, |(first, range)| {
                    ordered_range(range, width, first, &cells)
                })
                .await
        }
        DitherType::Halftone => {
            // Ranges start on even rows so 2x2 blocks are never split.
            let oversized = image.pixels.len() > cfg.tone_chunk_bytes;
            let rows = scheduler.plan(height, 2, oversized);
            let units = split_ranges(&mut image.pixels, &rows, width * 4);
            scheduler
                .run_units(units, |(_, range)| halftone_rows(range, width, threshold))
                .await
        }
        DitherType::FloydSteinberg => {
            let mut gray = grayscale(&image.pixels);
            let oversized = width * height > cfg.dither_chunk_pixels;
            let rows = scheduler.plan(height, 1, oversized);
            let gray_units = split_ranges(&mut gray, &rows, width);
            let pixel_units = split_ranges(&mut image.pixels, &rows, width * 4);
            let units: Vec<_> = gray_units.into_iter().zip(pixel_units).collect();
            scheduler
                .run_units(units, |((first_row, g), (_, px))| {
                    diffuse_rows(g, px, width, first_row, threshold)
                })
                .await
        }
    }
}

fn log_report(stage: &str, report: &ChunkReport) {
    tracing::debug!(
        stage = %stage,
        units = report.units,
        elapsed_ms = report.elapsed.as_millis(),
        "chunked pass finished"
    );
}
