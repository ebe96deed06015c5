//! Tier configuration
//!
//! Configuration is layered: built-in defaults, an optional TOML file, then
//! `HYPERHOLD__*` environment variables (e.g. `HYPERHOLD__WATERMARK__HIGH_PERCENT=90`).
//!
//! ```toml
//! codec = "zstd"
//!
//! [area]
//! nr_objects = 262144
//! nr_extents = 8192
//! extent_shift = 15
//!
//! [cache]
//! fault_out = true
//! reclaim_in = true
//!
//! [watermark]
//! high_percent = 80
//! low_percent = 70
//! ```

use crate::error::{Error, Result};
use crate::tier::compression::CompressionAlgorithm;
use crate::tier::index::PAGE_SHIFT;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Smallest supported extent: one page
pub const MIN_EXTENT_SHIFT: u32 = PAGE_SHIFT;
/// Largest supported extent: 1 MiB
pub const MAX_EXTENT_SHIFT: u32 = 20;

/// Cache level bit: admit extents read on the fault-in path
pub const CACHE_LEVEL_FAULT_OUT: u32 = 1;
/// Cache level bit: admit extents read on the batch-out path
pub const CACHE_LEVEL_BATCH_OUT: u32 = 2;
/// Cache level bit: admit extents written on the reclaim-in path
pub const CACHE_LEVEL_RECLAIM_IN: u32 = 4;

/// Complete configuration of one secondary tier
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    pub area: AreaConfig,
    pub cache: CacheConfig,
    pub watermark: WatermarkConfig,
    pub codec: CompressionAlgorithm,
}

/// Capacity of the area, fixed at attach time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AreaConfig {
    /// Number of primary-store objects (pages)
    pub nr_objects: u32,
    /// Number of extents in the secondary tier
    pub nr_extents: u32,
    /// log2 of the extent size in bytes
    pub extent_shift: u32,
    /// Size of the group id space; id 0 is reserved
    pub nr_groups: u32,
}

impl Default for AreaConfig {
    fn default() -> Self {
        Self {
            nr_objects: 1 << 16,
            nr_extents: 1 << 11,
            extent_shift: 15,
            nr_groups: 65535,
        }
    }
}

impl AreaConfig {
    /// Derive capacities from the original (uncompressed) and compressed
    /// device sizes, in bytes
    pub fn from_sizes(original_bytes: u64, compressed_bytes: u64, extent_shift: u32) -> Result<Self> {
        let extent_size = 1u64 << extent_shift;
        if compressed_bytes & (extent_size - 1) != 0 {
            return Err(Error::Config(format!(
                "compressed size {} is not aligned to the {} byte extent size",
                compressed_bytes, extent_size
            )));
        }
        let nr_extents = u32::try_from(compressed_bytes >> extent_shift)
            .map_err(|_| Error::Config(format!("too many extents for {} bytes", compressed_bytes)))?;
        let nr_objects = u32::try_from(original_bytes >> PAGE_SHIFT)
            .map_err(|_| Error::Config(format!("too many objects for {} bytes", original_bytes)))?;

        Ok(Self {
            nr_objects,
            nr_extents,
            extent_shift,
            ..Self::default()
        })
    }

    /// Extent size in bytes
    pub fn extent_size(&self) -> usize {
        1 << self.extent_shift
    }
}

/// Extent cache admission and eviction settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache extents read for a single-object fault
    pub fault_out: bool,
    /// Cache extents read for a whole-group batch out
    pub batch_out: bool,
    /// Cache extents as they are written
    pub reclaim_in: bool,
    /// Capacity of the cache index (0 = one slot per extent)
    pub max_extents: usize,
    /// Extents storing fewer bytes are skipped by the pressure shrinker
    pub shrink_min_bytes: u64,
    /// Only cached extents storing at most this many bytes are compacted
    pub move_max_bytes: u64,
    /// Target used by `drop_cache(0)`, in pages
    pub soft_limit_pages: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            fault_out: false,
            batch_out: false,
            reclaim_in: false,
            max_extents: 0,
            shrink_min_bytes: 8 * 1024,
            move_max_bytes: 24 * 1024,
            soft_limit_pages: 16 * 1024,
        }
    }
}

impl CacheConfig {
    /// Encode the admission toggles as a cache level bitmask
    pub fn level(&self) -> u32 {
        let mut level = 0;
        if self.fault_out {
            level |= CACHE_LEVEL_FAULT_OUT;
        }
        if self.batch_out {
            level |= CACHE_LEVEL_BATCH_OUT;
        }
        if self.reclaim_in {
            level |= CACHE_LEVEL_RECLAIM_IN;
        }
        level
    }
}

/// Proactive compaction thresholds, in percent of total extents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatermarkConfig {
    pub high_percent: u32,
    pub low_percent: u32,
}

impl Default for WatermarkConfig {
    fn default() -> Self {
        Self {
            high_percent: 80,
            low_percent: 70,
        }
    }
}

impl WatermarkConfig {
    /// Extent count at which compaction starts
    pub fn high_extents(&self, total: u32) -> u32 {
        (total as u64 * self.high_percent as u64 / 100) as u32
    }

    /// Extent count compaction drains down to
    pub fn low_extents(&self, total: u32) -> u32 {
        (total as u64 * self.low_percent as u64 / 100) as u32
    }
}

impl TierConfig {
    /// Load configuration from defaults, an optional TOML file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            info!(path = ?path, "Loading tier configuration");
            builder = builder.add_source(
                ::config::File::from(path)
                    .format(::config::FileFormat::Toml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix("HYPERHOLD")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let cfg: TierConfig = builder.build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: TierConfig =
            toml::from_str(s).map_err(|e| Error::Config(format!("Invalid TOML: {}", e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(format!("Failed to render TOML: {}", e)))
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> Result<()> {
        let area = &self.area;
        if !(MIN_EXTENT_SHIFT..=MAX_EXTENT_SHIFT).contains(&area.extent_shift) {
            return Err(Error::Config(format!(
                "extent_shift {} outside {}..={}",
                area.extent_shift, MIN_EXTENT_SHIFT, MAX_EXTENT_SHIFT
            )));
        }
        if area.nr_extents == 0 || area.nr_objects == 0 {
            return Err(Error::Config("area needs at least one extent and one object".to_string()));
        }
        if area.nr_groups < 2 || area.nr_groups > u16::MAX as u32 + 1 {
            return Err(Error::Config(format!("nr_groups {} outside 2..=65536", area.nr_groups)));
        }
        let total = area.nr_objects as u64 + area.nr_extents as u64 + area.nr_groups as u64;
        if total > u32::MAX as u64 {
            return Err(Error::Config("unified index space exceeds u32".to_string()));
        }
        let wm = &self.watermark;
        if wm.high_percent > 100 || wm.low_percent > wm.high_percent {
            return Err(Error::Config(format!(
                "watermarks must satisfy low <= high <= 100 (low {}, high {})",
                wm.low_percent, wm.high_percent
            )));
        }
        Ok(())
    }
}
