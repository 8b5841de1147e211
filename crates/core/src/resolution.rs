use std::fmt;

use tracing::warn;

use crate::config::GenerationDefaults;
use crate::model_registry::ModelEntry;

/// Smallest side any generation pass is allowed to run at.
pub const MIN_DIMENSION: u32 = 16;

const LEGACY_HINT: Resolution = Resolution::new(1024, 576);
const LEGACY_INPUT: Resolution = Resolution::new(1344, 768);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixels(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    /// Both sides multiplied by `factor`, ties rounded to even.
    pub fn scaled(&self, factor: f64) -> Self {
        Self::new(
            round_dimension(f64::from(self.width) * factor),
            round_dimension(f64::from(self.height) * factor),
        )
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionPolicy {
    ModelPreferred,
    ImageAspectModelRes,
    Image,
}

impl ResolutionPolicy {
    pub const MODEL_PREFERRED: &'static str = "Model Preferred";
    pub const IMAGE_ASPECT_MODEL_RES: &'static str = "Image Aspect, Model Res";
    pub const IMAGE: &'static str = "Image";

    /// Parses a request value; unknown names fall back to `ModelPreferred`.
    pub fn parse(name: &str) -> Self {
        match name {
            Self::MODEL_PREFERRED => Self::ModelPreferred,
            Self::IMAGE_ASPECT_MODEL_RES => Self::ImageAspectModelRes,
            Self::IMAGE => Self::Image,
            other => {
                warn!(policy = other, "Unknown video resolution policy, using model preferred");
                Self::ModelPreferred
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ModelPreferred => Self::MODEL_PREFERRED,
            Self::ImageAspectModelRes => Self::IMAGE_ASPECT_MODEL_RES,
            Self::Image => Self::IMAGE,
        }
    }
}

/// Preferred resolution of `entry`, or the configured fallback when the
/// model declares none.
pub fn model_hint(entry: &ModelEntry, defaults: &GenerationDefaults) -> Resolution {
    if entry.standard_width == 0 || entry.standard_height == 0 {
        Resolution::new(defaults.fallback_model_width, defaults.fallback_model_height)
    } else {
        Resolution::new(entry.standard_width, entry.standard_height)
    }
}

/// Generation resolution for a video pass.
///
/// `image_scale` is only honoured by the `Image` policy; callers pass it when
/// no latent upscaler will scale the result later.
pub fn resolve(
    policy: ResolutionPolicy,
    hint: Resolution,
    input: Resolution,
    image_scale: Option<f64>,
    precision: u32,
) -> Resolution {
    match policy {
        ResolutionPolicy::ModelPreferred => hint,
        ResolutionPolicy::ImageAspectModelRes => {
            if hint == LEGACY_HINT && input == LEGACY_INPUT {
                hint
            } else {
                res_to_model_fit(input, hint.pixels(), precision)
            }
        }
        ResolutionPolicy::Image => match image_scale {
            Some(scale) => input.scaled(scale),
            None => input,
        },
    }
}

/// Fits `input`'s aspect ratio into `pixel_budget` pixels, each side rounded
/// down to a multiple of `precision` and never below it.
pub fn res_to_model_fit(input: Resolution, pixel_budget: u64, precision: u32) -> Resolution {
    let precision = precision.max(1);
    if input.pixels() == 0 {
        return Resolution::new(precision, precision);
    }
    let scale = (pixel_budget as f64 / input.pixels() as f64).sqrt();
    let fit = |side: u32| -> u32 {
        let scaled = (f64::from(side) * scale).floor() as u32;
        ((scaled / precision) * precision).max(precision)
    };
    Resolution::new(fit(input.width), fit(input.height))
}

/// Base (pre-upscale) resolution for a two-stage pass targeting `target`.
pub fn split_base_target(target: Resolution, scale: f64) -> Resolution {
    let width = round_signed(f64::from(target.width) / scale);
    let height = round_signed(f64::from(target.height) / scale);
    if width <= 0 || height <= 0 {
        warn!(
            base_width = width,
            base_height = height,
            %target,
            scale,
            "Invalid base resolution computed, falling back to target resolution"
        );
        return Resolution::new(
            target.width.max(MIN_DIMENSION),
            target.height.max(MIN_DIMENSION),
        );
    }
    Resolution::new(clamp_dimension(width), clamp_dimension(height))
}

fn round_signed(value: f64) -> i64 {
    if value.is_finite() {
        value.round_ties_even() as i64
    } else {
        0
    }
}

fn clamp_dimension(value: i64) -> u32 {
    u32::try_from(value)
        .unwrap_or(u32::MAX)
        .max(MIN_DIMENSION)
}

fn round_dimension(value: f64) -> u32 {
    u32::try_from(round_signed(value).max(0)).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_registry::CompatClass;

    fn entry(width: u32, height: u32) -> ModelEntry {
        ModelEntry {
            name: "m".into(),
            compat_class: CompatClass::Ltxv2,
            standard_width: width,
            standard_height: height,
            description: String::new(),
        }
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!(
            ResolutionPolicy::parse("Image Aspect, Model Res"),
            ResolutionPolicy::ImageAspectModelRes
        );
        assert_eq!(ResolutionPolicy::parse("Image"), ResolutionPolicy::Image);
        assert_eq!(
            ResolutionPolicy::parse("something else"),
            ResolutionPolicy::ModelPreferred
        );
        assert_eq!(ResolutionPolicy::Image.as_str(), "Image");
    }

    #[test]
    fn test_model_hint_falls_back_when_undeclared() {
        let defaults = GenerationDefaults::default();
        assert_eq!(model_hint(&entry(0, 0), &defaults), Resolution::new(1024, 576));
        assert_eq!(model_hint(&entry(1280, 704), &defaults), Resolution::new(1280, 704));
    }

    #[test]
    fn test_model_preferred_returns_hint() {
        let hint = Resolution::new(1280, 704);
        let out = resolve(
            ResolutionPolicy::ModelPreferred,
            hint,
            Resolution::new(512, 512),
            Some(2.0),
            64,
        );
        assert_eq!(out, hint);
    }

    #[test]
    fn test_image_aspect_legacy_short_circuit() {
        let out = resolve(
            ResolutionPolicy::ImageAspectModelRes,
            Resolution::new(1024, 576),
            Resolution::new(1344, 768),
            None,
            64,
        );
        assert_eq!(out, Resolution::new(1024, 576));
    }

    #[test]
    fn test_image_aspect_fits_budget() {
        let out = resolve(
            ResolutionPolicy::ImageAspectModelRes,
            Resolution::new(1024, 576),
            Resolution::new(512, 512),
            None,
            64,
        );
        // sqrt(1024*576) = 768 per side.
        assert_eq!(out, Resolution::new(768, 768));

        let portrait = resolve(
            ResolutionPolicy::ImageAspectModelRes,
            Resolution::new(1280, 720),
            Resolution::new(720, 1280),
            None,
            16,
        );
        assert_eq!(portrait, Resolution::new(720, 1280));
    }

    #[test]
    fn test_fit_never_below_precision() {
        let out = res_to_model_fit(Resolution::new(10_000, 10), 64 * 64, 64);
        assert_eq!(out.height, 64);
        assert_eq!(out.width % 64, 0);
    }

    #[test]
    fn test_image_policy_scales_only_when_asked() {
        let input = Resolution::new(640, 360);
        assert_eq!(
            resolve(ResolutionPolicy::Image, Resolution::new(1, 1), input, None, 64),
            input
        );
        assert_eq!(
            resolve(ResolutionPolicy::Image, Resolution::new(1, 1), input, Some(1.5), 64),
            Resolution::new(960, 540)
        );
    }

    #[test]
    fn test_split_base_target_scenario() {
        let base = split_base_target(Resolution::new(1280, 704), 1.5);
        // 853.33 -> 853, 469.33 -> 469
        assert_eq!(base, Resolution::new(853, 469));
    }

    #[test]
    fn test_split_rounds_ties_to_even() {
        let base = split_base_target(Resolution::new(1001, 1003), 2.0);
        assert_eq!(base, Resolution::new(500, 502));
    }

    #[test]
    fn test_split_falls_back_on_degenerate_scale() {
        let target = Resolution::new(1280, 704);
        assert_eq!(split_base_target(target, -2.0), target);
        assert_eq!(split_base_target(target, f64::INFINITY), target);
        assert_eq!(
            split_base_target(Resolution::new(8, 8), 0.0),
            Resolution::new(16, 16)
        );
    }

    #[test]
    fn test_split_clamps_small_positive_bases() {
        assert_eq!(
            split_base_target(Resolution::new(64, 64), 8.0),
            Resolution::new(16, 16)
        );
    }

    #[test]
    fn test_base_times_scale_round_trips_within_one() {
        for scale in [1.25, 1.5, 2.0, 2.5, 3.0] {
            for (w, h) in [(1280, 704), (1024, 576), (832, 480), (720, 1280)] {
                let target = Resolution::new(w, h);
                let base = split_base_target(target, scale);
                let back = base.scaled(scale);
                assert!(base.width >= MIN_DIMENSION && base.height >= MIN_DIMENSION);
                assert!(back.width.abs_diff(target.width) <= 1, "{target} @ {scale}");
                assert!(back.height.abs_diff(target.height) <= 1, "{target} @ {scale}");
            }
        }
    }
}
