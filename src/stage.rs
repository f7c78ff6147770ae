//! Optional post-filter stages.
//!
//! A [`PostStage`] rewrites a [`Layer`] in place. Disabled stages are skipped,
//! leaving the layer untouched. A stage that fails is bypassed the same way:
//! the error is logged and the next stage sees the unmodified input.
//!
//! ```ignore
//! let mut mirror = Mirror::new(true, false);
//! apply_stages(&mut [&mut streak, &mut mirror], &mut layer);
//! ```

use crate::error::StageError;
use crate::frame::Layer;

/// An image-to-image filter that can be switched off.
pub trait PostStage {
    /// Short name used in log messages.
    fn name(&self) -> &'static str;

    /// Disabled stages behave as the identity.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Filter `layer` in place.
    ///
    /// Implementations must validate before writing, so an error leaves
    /// `layer` unchanged.
    fn apply(&mut self, layer: &mut Layer) -> Result<(), StageError>;
}

/// Run `stages` in order over `layer`, bypassing disabled or failing ones.
///
/// Returns the number of stages that were applied.
pub fn apply_stages(stages: &mut [&mut dyn PostStage], layer: &mut Layer) -> usize {
    let mut applied = 0;
    for stage in stages.iter_mut() {
        if !stage.is_enabled() {
            continue;
        }
        match stage.apply(layer) {
            Ok(()) => applied += 1,
            Err(e) => log::warn!("Bypassing {} stage: {}", stage.name(), e),
        }
    }
    applied
}

/// Flip the image horizontally and/or vertically.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Mirror {
    pub horizontal: bool,
    pub vertical: bool,
}

impl Mirror {
    pub fn new(horizontal: bool, vertical: bool) -> Self {
        Self { horizontal, vertical }
    }
}

impl PostStage for Mirror {
    fn name(&self) -> &'static str {
        "mirror"
    }

    fn is_enabled(&self) -> bool {
        self.horizontal || self.vertical
    }

    fn apply(&mut self, layer: &mut Layer) -> Result<(), StageError> {
        layer.mirror(self.horizontal, self.vertical);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    impl PostStage for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn apply(&mut self, layer: &mut Layer) -> Result<(), StageError> {
            Err(StageError::SizeMismatch {
                expected: (1, 1),
                actual: layer.dimensions(),
            })
        }
    }

    #[test]
    fn test_disabled_stage_is_identity() {
        let mut layer = Layer::new(3, 2).unwrap();
        layer.put_pixel(0, 0, [1.0, 0.0, 0.0, 1.0]);
        let before = layer.as_raw().to_vec();
        let mut mirror = Mirror::default();
        assert_eq!(apply_stages(&mut [&mut mirror], &mut layer), 0);
        assert_eq!(layer.as_raw(), &before[..]);
    }

    #[test]
    fn test_failing_stage_is_bypassed() {
        let mut layer = Layer::new(3, 2).unwrap();
        layer.put_pixel(0, 0, [1.0, 0.0, 0.0, 1.0]);
        let mut failing = Failing;
        let mut mirror = Mirror::new(false, true);
        assert_eq!(apply_stages(&mut [&mut failing, &mut mirror], &mut layer), 1);
        assert_eq!(layer.pixel(0, 1), [1.0, 0.0, 0.0, 1.0]);
    }
}
