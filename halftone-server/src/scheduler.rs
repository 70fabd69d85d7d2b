//! Cooperative chunking of large raster passes.
//!
//! Work is split into contiguous units and drained from a queue one unit at
//! a time; after each unit the scheduler yields to the tokio runtime so
//! other tasks (HTTP handlers, other runs) get a turn. Units never run in
//! parallel. A `run_*` call returns only after every unit has completed.

use std::collections::VecDeque;
use std::ops::Range;
use std::time::{Duration, Instant};

use crate::config::Processing;

/// Tone passes over more bytes than this are chunked.
pub const DEFAULT_TONE_CHUNK_BYTES: usize = 1024 * 1024;
/// Floyd-Steinberg over more pixels than this is chunked by rows.
pub const DEFAULT_DITHER_CHUNK_PIXELS: usize = 250_000;

/// Units per oversized buffer: 2 on mobile-class targets, 4 elsewhere.
pub fn default_max_workers() -> usize {
    if cfg!(any(target_os = "android", target_os = "ios")) {
        2
    } else {
        4
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkConfig {
    pub max_workers: usize,
    pub tone_chunk_bytes: usize,
    pub dither_chunk_pixels: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            tone_chunk_bytes: DEFAULT_TONE_CHUNK_BYTES,
            dither_chunk_pixels: DEFAULT_DITHER_CHUNK_PIXELS,
        }
    }
}

impl ChunkConfig {
    pub fn from_processing(p: Option<&Processing>) -> Self {
        let d = Self::default();
        let Some(p) = p else { return d };
        Self {
            max_workers: p.max_workers.unwrap_or(d.max_workers).max(1),
            tone_chunk_bytes: p.tone_chunk_bytes.unwrap_or(d.tone_chunk_bytes),
            dither_chunk_pixels: p.dither_chunk_pixels.unwrap_or(d.dither_chunk_pixels),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkReport {
    pub units: usize,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct ChunkScheduler {
    cfg: ChunkConfig,
}

impl ChunkScheduler {
    pub fn new(cfg: ChunkConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &ChunkConfig {
        &self.cfg
    }

    /// Split `0..total` into contiguous ranges whose boundaries fall on
    /// multiples of `align`. A single range is returned unless `oversized`.
    pub fn plan(&self, total: usize, align: usize, oversized: bool) -> Vec<Range<usize>> {
        let align = align.max(1);
        if total == 0 {
            return Vec::new();
        }
        if !oversized || self.cfg.max_workers <= 1 {
            return vec![0..total];
        }
        let per = total.div_ceil(self.cfg.max_workers);
        let per = per.div_ceil(align) * align;
        let mut out = Vec::with_capacity(self.cfg.max_workers);
        let mut start = 0;
        while start < total {
            let end = (start + per).min(total);
            out.push(start..end);
            start = end;
        }
        out
    }

    /// Run each unit in order, yielding to the runtime between units.
    pub async fn run_units<T, F>(&self, units: Vec<T>, mut work: F) -> ChunkReport
    where
        F: FnMut(T),
    {
        let started = Instant::now();
        let mut queue: VecDeque<T> = units.into();
        let mut done = 0usize;
        while let Some(unit) = queue.pop_front() {
            work(unit);
            done += 1;
            if !queue.is_empty() {
                tokio::task::yield_now().await;
            }
        }
        ChunkReport {
            units: done,
            elapsed: started.elapsed(),
        }
    }

    /// Chunk an RGBA buffer along pixel-aligned byte ranges.
    ///
    /// `work` receives the absolute pixel index of its first pixel and the slice.
    pub async fn run_pixel_ranges<F>(
        &self,
        pixels: &mut [u8],
        work: F,
    ) -> ChunkReport
    where
        F: FnMut((usize, &mut [u8])),
    {
        let oversized = pixels.len() > self.cfg.tone_chunk_bytes;
        let ranges = self.plan(pixels.len(), 4, oversized);
        let units = split_ranges(pixels, &ranges, 1)
            .into_iter()
            .map(|(offset, s)| (offset / 4, s))
            .collect();
        self.run_units(units, work).await
    }

    /// Give the runtime a turn between stages that are not chunked.
    pub async fn yield_point(&self) {
        tokio::task::yield_now().await;
    }
}

/// Carve `buf` into disjoint mutable slices for `ranges` (in items of `unit` bytes).
///
/// Ranges must be ascending and non-overlapping. Returns `(start_item, slice)`.
pub fn split_ranges<'a>(
    buf: &'a mut [u8],
    ranges: &[Range<usize>],
    unit: usize,
) -> Vec<(usize, &'a mut [u8])> {
    let mut out = Vec::with_capacity(ranges.len());
    let mut rest = buf;
    let mut consumed = 0usize;
    for r in ranges {
        let skip = (r.start - consumed) * unit;
        let len = (r.end - r.start) * unit;
        let tail = std::mem::take(&mut rest);
        let (_, tail) = tail.split_at_mut(skip);
        let (head, tail) = tail.split_at_mut(len);
        out.push((r.start, head));
        rest = tail;
        consumed = r.end;
    }
    out
}
