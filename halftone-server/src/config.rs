use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;
use toml_edit::{DocumentMut, Item, value};

use crate::dither::DitherType;

#[cfg(feature = "embed_config")]
use rust_embed::RustEmbed;

#[cfg(feature = "embed_config")]
#[derive(RustEmbed)]
#[folder = "../"]
#[include = "halftone.example.toml"]
struct ConfigAssets;

/// Default on-disk config filename
pub const DEFAULT_CONFIG_PATH: &str = "halftone.toml";

/// Strongly typed representation of the configuration.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    pub server: Option<Server>,
    pub logging: Option<Logging>,
    pub cache: Option<CacheSettings>,
    pub processing: Option<Processing>,
    /// Parameters used when a request omits them.
    pub defaults: Option<Defaults>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Server {
    pub bind_address: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Logging {
    pub filter: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct CacheSettings {
    /// When false, results are kept in memory only for the lifetime of the process.
    pub enabled: Option<bool>,
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Processing {
    /// Number of work units a large buffer is split into. Platform default when unset.
    pub max_workers: Option<usize>,
    /// Tone passes over buffers larger than this many bytes are chunked.
    pub tone_chunk_bytes: Option<usize>,
    /// Floyd-Steinberg over images larger than this many pixels is chunked by rows.
    pub dither_chunk_pixels: Option<usize>,
    /// Images above this pixel count are nearest-neighbor reduced before dithering.
    pub max_dither_pixels: Option<usize>,
    pub jpeg_quality: Option<u8>,
    pub backend: Option<ResampleBackend>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResampleBackend {
    /// Area-average / bilinear implementation in `resample.rs`.
    #[default]
    Portable,
    /// Delegate the tone-path resize to `image::imageops`.
    #[serde(rename = "imageops")]
    ImageOps,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Defaults {
    pub dither: Option<DitherType>,
    #[serde(flatten)]
    pub adjustments: FilterAdjustments,
}

/// Tone and dither parameters for one processing run.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct FilterAdjustments {
    pub scale: f32,
    pub contrast: f32,
    pub midtones: f32,
    pub highlights: f32,
    #[serde(alias = "luminanceThreshold")]
    pub luminance_threshold: f32,
    pub blur: f32,
    pub invert: bool,
}

impl Default for FilterAdjustments {
    fn default() -> Self {
        Self {
            scale: 1.0,
            contrast: 0.0,
            midtones: 0.0,
            highlights: 0.0,
            luminance_threshold: 128.0,
            blur: 0.0,
            invert: false,
        }
    }
}

impl FilterAdjustments {
    /// Copy with every field forced into its supported range. NaN falls back to the default.
    pub fn clamped(&self) -> Self {
        let d = Self::default();
        let fix = |v: f32, lo: f32, hi: f32, fallback: f32| {
            if v.is_nan() { fallback } else { v.clamp(lo, hi) }
        };
        Self {
            scale: fix(self.scale, 0.5, 2.0, d.scale),
            contrast: fix(self.contrast, -50.0, 50.0, d.contrast),
            midtones: fix(self.midtones, -50.0, 50.0, d.midtones),
            highlights: fix(self.highlights, -50.0, 50.0, d.highlights),
            luminance_threshold: fix(self.luminance_threshold, 0.0, 255.0, d.luminance_threshold),
            blur: fix(self.blur, 0.0, 10.0, d.blur),
            invert: self.invert,
        }
    }
}

/// Internal manager state kept behind an `Arc<RwLock<_>>`.
#[derive(Debug)]
pub struct ConfigManager {
    path: PathBuf,
    doc: DocumentMut,
}

pub type SharedConfig = Arc<RwLock<ConfigManager>>;

/// Partial update of the `[defaults]` table; `None` leaves a key untouched.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefaultsUpdate {
    pub dither: Option<DitherType>,
    pub scale: Option<f32>,
    pub contrast: Option<f32>,
    pub midtones: Option<f32>,
    pub highlights: Option<f32>,
    #[serde(alias = "luminance_threshold")]
    pub luminance_threshold: Option<f32>,
    pub blur: Option<f32>,
    pub invert: Option<bool>,
    /// Drop the default algorithm so requests without one are not dithered.
    #[serde(skip)]
    pub clear_dither: bool,
}

impl ConfigManager {
    /// Load existing config file. If the file does not exist, creates it from the embedded example.
    pub async fn load(path: Option<PathBuf>) -> Result<SharedConfig> {
        let path = path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

        if !path.exists() {
            #[cfg(feature = "embed_config")]
            {
                if let Some(example_file) = ConfigAssets::get("halftone.example.toml") {
                    let example_content = std::str::from_utf8(&example_file.data)
                        .with_context(|| "embedded example config is not valid UTF-8")?;

                    fs::write(&path, example_content)
                        .await
                        .with_context(|| format!("writing example config to {}", path.display()))?;

                    tracing::info!(path = %path.display(), "created default config file");
                } else {
                    bail!(
                        "config file {} not found and embedded example is not available",
                        path.display()
                    );
                }
            }
            #[cfg(not(feature = "embed_config"))]
            {
                bail!("config file {} not found", path.display());
            }
        }

        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_str_at(path, &text)
    }

    /// Build a manager from TOML text without touching the filesystem.
    pub fn from_str_at(path: PathBuf, text: &str) -> Result<SharedConfig> {
        let doc = text
            .parse::<DocumentMut>()
            .with_context(|| format!("parsing config {}", path.display()))?;
        // Fail early on type errors rather than on first request.
        toml_edit::de::from_document::<Config>(doc.clone())
            .with_context(|| format!("validating config {}", path.display()))?;
        Ok(Arc::new(RwLock::new(Self { path, doc })))
    }

    /// Convert current document to strongly typed struct.
    pub async fn to_struct(cfg: &SharedConfig) -> Result<Config> {
        let guard = cfg.read().await;
        let typed: Config = toml_edit::de::from_document(guard.doc.clone())?;
        Ok(typed)
    }

    /// Update request defaults. Only provided values are changed.
    pub async fn update_defaults(cfg: &SharedConfig, update: &DefaultsUpdate) -> Result<()> {
        let mut guard = cfg.write().await;
        let defaults = guard.doc["defaults"].or_insert(Item::Table(toml_edit::Table::new()));
        let Item::Table(tbl) = defaults else {
            bail!("[defaults] is not a table");
        };
        if let Some(d) = update.dither {
            tbl["dither"] = value(d.as_str());
        } else if update.clear_dither {
            tbl.remove("dither");
        }
        let floats = [
            ("scale", update.scale),
            ("contrast", update.contrast),
            ("midtones", update.midtones),
            ("highlights", update.highlights),
            ("luminance_threshold", update.luminance_threshold),
            ("blur", update.blur),
        ];
        for (key, v) in floats {
            if let Some(v) = v {
                if !v.is_finite() {
                    bail!("{key} must be a finite number");
                }
                tbl[key] = value(v as f64);
            }
        }
        if let Some(v) = update.invert {
            tbl["invert"] = value(v);
        }
        Ok(())
    }

    /// Atomic write of current document to disk (best-effort durability via rename).
    pub async fn save(cfg: &SharedConfig) -> Result<()> {
        let (path, contents) = {
            let guard = cfg.read().await;
            (guard.path.clone(), guard.doc.to_string())
        };
        let tmp = path.with_extension("toml.tmp");
        fs::write(&tmp, contents)
            .await
            .with_context(|| format!("writing tmp config {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("renaming tmp config to {}", path.display()))?;
        Ok(())
    }
}
