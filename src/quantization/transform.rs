//! Program-level quantization transforms: `quant_aware` and `convert`.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, info};

use super::observers::ActivationObserver;
use super::pact::ActPreprocessFn;
use super::qat_config::QuantConfig;
use super::qat_layers::{QuantAwareLayer, Quantizable};
use crate::error::{Error, Result};
use crate::nn::Module;
use crate::optim::{Optimizer, OptimizerFactory};
use crate::program::{Place, Program, ProgramKind};
use crate::scope::{Parameter, Scope};

/// State threaded through [`Module::quant_aware`] while a network is rewritten.
pub struct QuantAwareContext<'a> {
    scope: &'a Scope,
    config: &'a QuantConfig,
    for_test: bool,
    act_preprocess: Option<&'a ActPreprocessFn>,
    created: Vec<Parameter>,
    instrumented: Vec<String>,
}

impl<'a> QuantAwareContext<'a> {
    pub fn new(
        scope: &'a Scope,
        config: &'a QuantConfig,
        for_test: bool,
        act_preprocess: Option<&'a ActPreprocessFn>,
    ) -> Self {
        Self {
            scope,
            config,
            for_test,
            act_preprocess,
            created: Vec::new(),
            instrumented: Vec::new(),
        }
    }

    pub fn config(&self) -> &QuantConfig {
        self.config
    }

    pub fn is_for_test(&self) -> bool {
        self.for_test
    }

    /// Batch norm is frozen only in training programs.
    pub fn freeze_bn(&self) -> bool {
        self.config.freeze_bn && !self.for_test
    }

    /// Parameters registered by the preprocess hook so far.
    pub fn created_parameters(&self) -> &[Parameter] {
        &self.created
    }

    pub fn instrumented(&self) -> &[String] {
        &self.instrumented
    }

    /// Wraps `layer` in fake-quant ops if its op type and name are selected.
    pub fn instrument<Q>(&mut self, layer: &Q) -> Result<Box<dyn Module>>
    where
        Q: Quantizable + Clone + 'static,
    {
        let op_type = layer.op_type();
        if !self.config.should_quantize(op_type, layer.name()) {
            debug!(layer = layer.name(), op = %op_type, "left in float");
            return Ok(Box::new(layer.clone()));
        }

        let input_name = format!("{}_input", layer.name());
        let preprocess = match self.act_preprocess {
            Some(hook) if !self.for_test => {
                let module = hook(&input_name, self.scope)?;
                self.created.extend(module.parameters());
                Some(module)
            }
            _ => None,
        };
        let observer = ActivationObserver::new(self.scope, &input_name, self.config)?;

        debug!(
            layer = layer.name(),
            op = %op_type,
            preprocess = preprocess.is_some(),
            "inserted fake quantization"
        );
        self.instrumented.push(layer.name().to_string());
        Ok(Box::new(QuantAwareLayer::new(
            layer.clone_quantizable(),
            preprocess,
            observer,
            self.config,
        )))
    }
}

/// Options of [`quant_aware`] beyond the config dictionary.
#[derive(Clone, Default)]
pub struct QuantAwareOptions {
    /// Build an inference program: no preprocess hook, no optimizers.
    pub for_test: bool,
    pub act_preprocess: Option<ActPreprocessFn>,
    /// Required when `act_preprocess` creates parameters in a training program.
    pub optimizer_factory: Option<OptimizerFactory>,
}

impl QuantAwareOptions {
    pub fn for_test() -> Self {
        Self {
            for_test: true,
            ..Self::default()
        }
    }
}

/// Inserts fake-quantize ops into a float program.
pub fn quant_aware(
    program: &Program,
    place: Place,
    config: &QuantConfig,
    options: QuantAwareOptions,
) -> Result<Program> {
    place.ensure_available()?;
    config.validate()?;
    if program.kind() != ProgramKind::Float {
        return Err(Error::InvalidConfig(format!(
            "quant_aware expects a float program, got {:?}",
            program.kind()
        )));
    }

    let scope = program.scope().clone();
    let mut ctx = QuantAwareContext::new(
        &scope,
        config,
        options.for_test,
        options.act_preprocess.as_ref(),
    );
    let network = program.network().quant_aware(&mut ctx)?;
    let created = ctx.created_parameters().to_vec();
    let instrumented = ctx.instrumented().len();

    let mut optimizers: Vec<Rc<RefCell<Box<dyn Optimizer>>>> = Vec::new();
    if !options.for_test {
        optimizers.extend(program.optimizers().iter().cloned());
        if !created.is_empty() {
            let factory = options
                .optimizer_factory
                .as_ref()
                .ok_or(Error::MissingOptimizerFactory)?;
            debug!(count = created.len(), "attaching optimizer to preprocess parameters");
            optimizers.push(Rc::new(RefCell::new(factory(created))));
        }
    }

    info!(
        for_test = options.for_test,
        layers = instrumented,
        weight = ?config.weight_quantize_type,
        activation = ?config.activation_quantize_type,
        "quant_aware applied"
    );
    Ok(program.derive(
        network,
        ProgramKind::QuantAware,
        options.for_test,
        optimizers,
    ))
}

/// Freezes a quant-aware program into an inference program.
pub fn convert(program: &Program, place: Place, config: &QuantConfig) -> Result<Program> {
    place.ensure_available()?;
    config.validate()?;
    match program.kind() {
        ProgramKind::Float => Err(Error::NotQuantAware),
        ProgramKind::Converted => Ok(program.clone()),
        ProgramKind::QuantAware => {
            let network = program.network().convert(config)?;
            info!(
                onnx_format = config.onnx_format,
                layers = network.quantized_layers().len(),
                "converted quant-aware program"
            );
            Ok(program.derive(network, ProgramKind::Converted, true, Vec::new()))
        }
    }
}
