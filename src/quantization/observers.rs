//! Activation scale observers
//!
//! Each quantized activation owns a small set of persistable variables in the
//! scope, keyed by the activation name, so the training and evaluation
//! programs of one model read and write the same scale.

use tracing::trace;

use super::qat_config::{ActivationQuantizeType, QuantConfig};
use crate::error::Result;
use crate::nn::Mode;
use crate::scope::Scope;
use crate::Tensor;

const INIT_SCALE: f32 = 0.001;

#[derive(Debug, Clone)]
enum ScaleState {
    /// Scale taken from the current batch.
    AbsMax,
    MovingAverage {
        rate: f32,
        state: Tensor,
        accum: Tensor,
    },
    Range {
        window: Tensor,
        iter: Tensor,
    },
}

/// Tracks the quantization scale of one activation.
#[derive(Debug, Clone)]
pub struct ActivationObserver {
    name: String,
    scale: Tensor,
    state: ScaleState,
}

impl ActivationObserver {
    /// Creates or re-attaches to `<name>.scale` (and its companions) in `scope`.
    pub fn new(scope: &Scope, name: &str, config: &QuantConfig) -> Result<Self> {
        let scale = scope.persistable(&format!("{name}.scale"), &[1], INIT_SCALE)?;
        let state = match config.activation_quantize_type {
            ActivationQuantizeType::AbsMax => ScaleState::AbsMax,
            ActivationQuantizeType::MovingAverageAbsMax => ScaleState::MovingAverage {
                rate: config.moving_rate,
                state: scope.persistable(&format!("{name}.state"), &[1], 1.0)?,
                accum: scope.persistable(&format!("{name}.accum"), &[1], 1.0)?,
            },
            ActivationQuantizeType::RangeAbsMax => ScaleState::Range {
                window: scope.persistable(&format!("{name}.window"), &[config.window_size], 0.0)?,
                iter: scope.persistable(&format!("{name}.iter"), &[1], 0.0)?,
            },
        };
        Ok(Self {
            name: name.to_string(),
            scale,
            state,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Last stored scale.
    pub fn scale(&self) -> f32 {
        self.scale.data()[0]
    }

    /// Feeds the current batch maximum and returns the scale to quantize with.
    ///
    /// Only training updates the stored statistics, except `abs_max`, which
    /// always uses the current batch.
    pub fn observe(&self, batch_max: f32, mode: Mode) -> f32 {
        let next = match (&self.state, mode) {
            (ScaleState::AbsMax, _) => batch_max,
            (_, Mode::Eval) => return self.scale(),
            (ScaleState::MovingAverage { rate, state, accum }, Mode::Train) => {
                let mut s = state.data_mut();
                let mut a = accum.data_mut();
                s[0] = rate * s[0] + 1.0;
                a[0] = rate * a[0] + batch_max;
                a[0] / s[0]
            }
            (ScaleState::Range { window, iter }, Mode::Train) => {
                let mut w = window.data_mut();
                let mut it = iter.data_mut();
                let slot = it[0] as usize % w.len();
                w[slot] = batch_max;
                it[0] += 1.0;
                w.iter().copied().fold(0.0f32, f32::max)
            }
        };
        trace!(activation = %self.name, scale = next, "observed activation scale");
        self.scale.data_mut()[0] = next;
        next
    }
}
