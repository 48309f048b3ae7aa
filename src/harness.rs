//! End-to-end QAT verification: float baseline, quantization-aware
//! fine-tuning with PACT, conversion, and the before/after accuracy check.

use std::path::PathBuf;
use std::rc::Rc;

use tracing::{error, info};

use crate::data::{DataLoader, MnistDataset, MNIST_CLASSES};
use crate::error::{Error, Result};
use crate::mobilenet::MobileNet;
use crate::optim::{Momentum, Optimizer, OptimizerFactory};
use crate::program::{Executor, Place};
use crate::quantization::{convert, pact_preprocess, quant_aware, QuantAwareOptions, QuantConfig};
use crate::scope::{L2Decay, Parameter, Scope};
use crate::train::{evaluate, train, EvalResult};

pub const DEFAULT_TOLERANCE: f32 = 0.1;
pub const DEFAULT_DATA_DIR: &str = "./data/mnist";

const FLOAT_LR: f32 = 0.01;
const FLOAT_WEIGHT_DECAY: f32 = 4e-5;
const PACT_LR: f32 = 1e-4;
const MOMENTUM: f32 = 0.9;
const SMOKE_ITERS: usize = 10;
const LOG_INTERVAL: usize = 100;

/// How much of the data each phase sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Capped iterations and small batches.
    Smoke,
    Full,
}

impl RunMode {
    pub fn batch_size(self) -> usize {
        match self {
            RunMode::Smoke => 8,
            RunMode::Full => 64,
        }
    }

    pub fn stop_iter(self) -> Option<usize> {
        match self {
            RunMode::Smoke => Some(SMOKE_ITERS),
            RunMode::Full => None,
        }
    }
}

/// Where training and test samples come from.
#[derive(Debug, Clone, PartialEq)]
pub enum DataSource {
    /// IDX files under `dir`, downloaded when missing.
    Mnist { dir: PathBuf },
    /// Offline stand-in, see [`MnistDataset::synthetic`].
    Synthetic {
        train_samples: usize,
        test_samples: usize,
        classes: usize,
        seed: u64,
    },
}

impl DataSource {
    /// Train loader (drops the last partial batch) and test loader (keeps it).
    pub fn loaders(&self, batch_size: usize) -> Result<(DataLoader, DataLoader)> {
        let (train_set, test_set) = match self {
            DataSource::Mnist { dir } => (
                MnistDataset::load(dir, true)?,
                MnistDataset::load(dir, false)?,
            ),
            DataSource::Synthetic {
                train_samples,
                test_samples,
                classes,
                seed,
            } => (
                MnistDataset::synthetic(*train_samples, *classes, *seed),
                MnistDataset::synthetic(*test_samples, *classes, seed.wrapping_add(1)),
            ),
        };
        info!(train = train_set.len(), test = test_set.len(), batch_size, "datasets ready");
        Ok((
            DataLoader::new(train_set, batch_size, true)?,
            DataLoader::new(test_set, batch_size, false)?,
        ))
    }
}

/// Everything the workflow needs, normally read from the environment.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub mode: RunMode,
    pub data: DataSource,
    pub quant: QuantConfig,
    pub model_scale: f32,
    pub class_dim: usize,
    pub seed: u64,
    pub batch_size: usize,
    /// Iteration caps of the float training, QAT fine-tuning and evaluation loops.
    pub float_iters: Option<usize>,
    pub qat_iters: Option<usize>,
    pub eval_iters: Option<usize>,
    pub log_interval: usize,
    pub tolerance: f32,
}

impl HarnessConfig {
    /// Defaults for `mode` on real MNIST under [`DEFAULT_DATA_DIR`].
    pub fn for_mode(mode: RunMode) -> Self {
        Self {
            mode,
            data: DataSource::Mnist {
                dir: PathBuf::from(DEFAULT_DATA_DIR),
            },
            quant: QuantConfig::default(),
            model_scale: 1.0,
            class_dim: MNIST_CLASSES,
            seed: 0,
            batch_size: mode.batch_size(),
            float_iters: mode.stop_iter(),
            qat_iters: mode.stop_iter(),
            eval_iters: mode.stop_iter(),
            log_interval: LOG_INTERVAL,
            tolerance: DEFAULT_TOLERANCE,
        }
    }

    /// Reads `DATASET`, `MNIST_DATA_DIR` and `QUANT_CONFIG`.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// [`HarnessConfig::from_env`] over an arbitrary variable lookup.
    ///
    /// `DATASET=full` runs everything; `DATASET=synthetic` runs the smoke
    /// caps on generated data; anything else is the smoke run on MNIST.
    pub fn from_vars<F>(var: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let dataset = var("DATASET");
        let mode = match dataset.as_deref() {
            Some("full") => RunMode::Full,
            _ => RunMode::Smoke,
        };
        let mut config = Self::for_mode(mode);

        if dataset.as_deref() == Some("synthetic") {
            config.data = DataSource::Synthetic {
                train_samples: 512,
                test_samples: 256,
                classes: MNIST_CLASSES,
                seed: config.seed,
            };
        } else if let Some(dir) = var("MNIST_DATA_DIR") {
            config.data = DataSource::Mnist {
                dir: PathBuf::from(dir),
            };
        }

        if let Some(path) = var("QUANT_CONFIG") {
            config.quant = QuantConfig::from_file(path)?;
        }
        Ok(config)
    }
}

/// Top-1 accuracy before and after quantization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccuracyComparison {
    pub before: f32,
    pub after: f32,
}

impl AccuracyComparison {
    pub fn delta(&self) -> f32 {
        (self.after - self.before).abs()
    }

    /// Passes iff `|after - before| < tolerance`.
    pub fn check(&self, tolerance: f32) -> Result<()> {
        let delta = self.delta();
        if delta < tolerance {
            info!(
                before = self.before,
                after = self.after,
                delta,
                tolerance,
                "accuracy check passed"
            );
            return Ok(());
        }
        error!(
            before = self.before,
            after = self.after,
            delta,
            tolerance,
            "accuracy check failed"
        );
        Err(Error::AccuracyRegression {
            before: self.before,
            after: self.after,
            delta,
            tolerance,
        })
    }
}

/// Metrics of one workflow run.
#[derive(Debug, Clone)]
pub struct QatReport {
    pub baseline_train: EvalResult,
    pub before: EvalResult,
    pub qat_train: EvalResult,
    pub after: EvalResult,
    pub quantized_layers: Vec<String>,
    pub pact_parameters: Vec<String>,
}

impl QatReport {
    pub fn comparison(&self) -> AccuracyComparison {
        AccuracyComparison {
            before: self.before.top1,
            after: self.after.top1,
        }
    }

    pub fn check(&self, tolerance: f32) -> Result<()> {
        self.comparison().check(tolerance)
    }
}

/// The float → QAT → converted pipeline.
pub struct QatWorkflow {
    config: HarnessConfig,
}

impl QatWorkflow {
    pub fn new(config: HarnessConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Runs every phase. The accuracy check is left to [`QatReport::check`].
    pub fn run(&self) -> Result<QatReport> {
        let cfg = &self.config;
        cfg.quant.validate()?;
        let place = Place::select();
        let exe = Executor::new(place)?;
        let (mut train_loader, mut test_loader) = cfg.data.loaders(cfg.batch_size)?;

        let scope = Scope::new(cfg.seed);
        let mut program = MobileNet::new(cfg.model_scale)?.build_program(&scope, cfg.class_dim)?;
        let params = program.parameters();
        program.minimize(Box::new(
            Momentum::new(params, FLOAT_LR, MOMENTUM)
                .with_weight_decay(L2Decay(FLOAT_WEIGHT_DECAY)),
        ));
        let val_program = program.clone_for_test();

        info!(mode = ?cfg.mode, "training float model");
        let baseline_train = train(
            &exe,
            &program,
            &mut train_loader,
            cfg.float_iters,
            cfg.log_interval,
        )?;
        let before = evaluate(
            &exe,
            &val_program,
            &mut test_loader,
            cfg.eval_iters,
            cfg.log_interval,
        )?;

        let factory: OptimizerFactory = Rc::new(|params: Vec<Parameter>| -> Box<dyn Optimizer> {
            Box::new(Momentum::new(params, PACT_LR, MOMENTUM))
        });
        let qat_program = quant_aware(
            &program,
            place,
            &cfg.quant,
            QuantAwareOptions {
                for_test: false,
                act_preprocess: Some(pact_preprocess()),
                optimizer_factory: Some(factory),
            },
        )?;
        let qat_eval_program =
            quant_aware(&val_program, place, &cfg.quant, QuantAwareOptions::for_test())?;

        info!("fine-tuning quant-aware model");
        let qat_train = train(
            &exe,
            &qat_program,
            &mut train_loader,
            cfg.qat_iters,
            cfg.log_interval,
        )?;

        let converted = convert(&qat_eval_program, place, &cfg.quant)?;
        let after = evaluate(
            &exe,
            &converted,
            &mut test_loader,
            cfg.eval_iters,
            cfg.log_interval,
        )?;

        info!(top1 = before.top1, top5 = before.top5, "before quantization");
        info!(top1 = after.top1, top5 = after.top5, "after quantization");

        let pact_parameters = qat_program
            .parameters()
            .iter()
            .map(|p| p.name().to_string())
            .filter(|name| name.ends_with("_pact"))
            .collect();
        Ok(QatReport {
            baseline_train,
            before,
            qat_train,
            after,
            quantized_layers: converted.network().quantized_layers(),
            pact_parameters,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_the_smoke_run() {
        let config = HarnessConfig::from_vars(vars(&[])).unwrap();
        assert_eq!(config.mode, RunMode::Smoke);
        assert_eq!(config.batch_size, 8);
        assert_eq!(config.float_iters, Some(10));
        assert_eq!(
            config.data,
            DataSource::Mnist {
                dir: PathBuf::from("./data/mnist")
            }
        );
        assert_eq!(config.quant, QuantConfig::default());
        assert_eq!(config.tolerance, 0.1);
    }

    #[test]
    fn test_full_mode_and_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"onnx_format": true, "activation_quantize_type": "abs_max"}}"#)
            .unwrap();
        let path = file.path().to_string_lossy().into_owned();

        let config = HarnessConfig::from_vars(vars(&[
            ("DATASET", "full"),
            ("MNIST_DATA_DIR", "/tmp/mnist"),
            ("QUANT_CONFIG", path.as_str()),
        ]))
        .unwrap();
        assert_eq!(config.mode, RunMode::Full);
        assert_eq!(config.batch_size, 64);
        assert_eq!(config.qat_iters, None);
        assert!(config.quant.onnx_format);
        assert_eq!(
            config.data,
            DataSource::Mnist {
                dir: PathBuf::from("/tmp/mnist")
            }
        );
    }

    #[test]
    fn test_bad_quant_config_is_reported() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"weight_bits": 1}}"#).unwrap();
        let path = file.path().to_string_lossy().into_owned();
        assert!(matches!(
            HarnessConfig::from_vars(vars(&[("QUANT_CONFIG", path.as_str())])),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_synthetic_source() {
        let config = HarnessConfig::from_vars(vars(&[("DATASET", "synthetic")])).unwrap();
        assert_eq!(config.mode, RunMode::Smoke);
        let (train, test) = config.data.loaders(config.batch_size).unwrap();
        assert_eq!(train.num_batches(), 64);
        assert_eq!(test.num_batches(), 32);
    }

    #[test]
    fn test_comparison_is_strict() {
        let ok = AccuracyComparison {
            before: 0.90,
            after: 0.85,
        };
        assert!(ok.check(0.1).is_ok());

        let at_limit = AccuracyComparison {
            before: 0.5,
            after: 0.75,
        };
        assert!(matches!(
            at_limit.check(0.25),
            Err(Error::AccuracyRegression { delta, .. }) if delta == 0.25
        ));

        let nan = AccuracyComparison {
            before: f32::NAN,
            after: 0.5,
        };
        assert!(nan.check(0.1).is_err());
    }
}
