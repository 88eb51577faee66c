//! Generation request parameters handed to the text-to-image pipeline
//!
//! The pipeline itself is external; this module only turns user input
//! (resolution strings, seed choice, step count, prompt plus adapter trigger
//! word) into the concrete values it expects.

use rand::Rng;
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::sync::LazyLock;

static RESOLUTION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+)\s*[×x]\s*(\d+)").expect("resolution regex is valid")
});

/// Inclusive upper bound of randomly drawn seeds
pub const MAX_RANDOM_SEED: u64 = 1_000_000;

/// Seed value meaning "pick one at random"
pub const RANDOM_SEED_SENTINEL: i64 = -1;

/// User-facing denoising steps
pub const MIN_STEPS: u32 = 4;
pub const MAX_STEPS: u32 = 9;
pub const DEFAULT_STEPS: u32 = 8;

pub const DEFAULT_SEED: i64 = 42;

/// Output image size in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Parse the first `WIDTHxHEIGHT` (or `WIDTH×HEIGHT`) pair in `s`
    ///
    /// Falls back to 1024x1024 when no pair is found or a side overflows.
    pub fn parse(s: &str) -> Self {
        RESOLUTION_REGEX
            .captures(s)
            .and_then(|caps| {
                let width = caps[1].parse().ok()?;
                let height = caps[2].parse().ok()?;
                Some(Self::new(width, height))
            })
            .unwrap_or_default()
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self::new(1024, 1024)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// An aspect ratio and the resolutions offered for it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AspectPreset {
    pub label: &'static str,
    pub resolutions: &'static [&'static str],
}

pub const DEFAULT_ASPECT: &str = "Landscape (16:9)";

const ASPECT_PRESETS: &[AspectPreset] = &[
    AspectPreset {
        label: "Square (1:1)",
        resolutions: &["1024x1024", "1280x1280", "1440x1440"],
    },
    AspectPreset {
        label: "Landscape (16:9)",
        resolutions: &["1280x720", "1920x1088"],
    },
    AspectPreset {
        label: "Portrait (9:16)",
        resolutions: &["720x1280", "1088x1920"],
    },
    AspectPreset {
        label: "Landscape (4:3)",
        resolutions: &["1152x864", "1440x1088", "1920x1440"],
    },
    AspectPreset {
        label: "Portrait (3:4)",
        resolutions: &["864x1152", "1088x1440", "1440x1920"],
    },
    AspectPreset {
        label: "Landscape (16:10)",
        resolutions: &["1280x800", "1440x912", "1920x1200"],
    },
    AspectPreset {
        label: "Portrait (10:16)",
        resolutions: &["800x1280", "912x1440", "1200x1920"],
    },
    AspectPreset {
        label: "Ultra Wide (21:9)",
        resolutions: &["1344x576"],
    },
];

/// All aspect presets in display order
pub fn aspect_presets() -> &'static [AspectPreset] {
    ASPECT_PRESETS
}

/// Resolutions for an aspect label, or the default aspect's for unknown labels
pub fn resolutions_for(label: &str) -> &'static [&'static str] {
    let find = |wanted: &str| ASPECT_PRESETS.iter().find(|preset| preset.label == wanted);
    find(label)
        .or_else(|| find(DEFAULT_ASPECT))
        .map(|preset| preset.resolutions)
        .unwrap_or(&[])
}

/// Seed actually used for a generation
///
/// Draws from `1..=MAX_RANDOM_SEED` when `random` is set or `seed` is
/// [`RANDOM_SEED_SENTINEL`]. Other negative seeds cannot be handed to the
/// pipeline and are drawn at random as well.
pub fn resolve_seed<R: Rng>(seed: i64, random: bool, rng: &mut R) -> u64 {
    if random || seed == RANDOM_SEED_SENTINEL {
        return rng.gen_range(1..=MAX_RANDOM_SEED);
    }
    u64::try_from(seed).unwrap_or_else(|_| rng.gen_range(1..=MAX_RANDOM_SEED))
}

/// Prepend the adapter trigger word unless the prompt already mentions it
pub fn compose_prompt(prompt: &str, trigger: Option<&str>) -> String {
    let prompt = prompt.trim();
    let Some(trigger) = trigger.map(str::trim).filter(|t| !t.is_empty()) else {
        return prompt.to_string();
    };

    if prompt.to_lowercase().contains(&trigger.to_lowercase()) {
        prompt.to_string()
    } else if prompt.is_empty() {
        trigger.to_string()
    } else {
        format!("{trigger}, {prompt}")
    }
}

/// Everything the external pipeline needs for one image
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub width: u32,
    pub height: u32,
    pub seed: u64,
    pub num_inference_steps: u32,
    pub guidance_scale: f32,
}

impl GenerationRequest {
    /// Build a request from user-facing settings
    ///
    /// `steps` is clamped to `MIN_STEPS..=MAX_STEPS`; the pipeline runs one
    /// more inference step than the user-facing denoising step count.
    pub fn new<R: Rng>(
        prompt: impl Into<String>,
        resolution: &str,
        seed: i64,
        random_seed: bool,
        steps: u32,
        rng: &mut R,
    ) -> Self {
        let Resolution { width, height } = Resolution::parse(resolution);
        Self {
            prompt: prompt.into(),
            width,
            height,
            seed: resolve_seed(seed, random_seed, rng),
            num_inference_steps: steps.clamp(MIN_STEPS, MAX_STEPS) + 1,
            guidance_scale: 0.0,
        }
    }
}
