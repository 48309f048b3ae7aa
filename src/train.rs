use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use crate::data::DataLoader;
use crate::error::{Error, Result};
use crate::program::{Executor, Fetch, Program};

/// Mean metrics over the batches a loop observed.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EvalResult {
    pub loss: f32,
    pub top1: f32,
    pub top5: f32,
    pub batches: usize,
}

/// Per-batch `(loss, top1, top5)` in arrival order.
#[derive(Debug, Default, Clone)]
pub struct MetricsAccumulator {
    records: Vec<Fetch>,
}

impl MetricsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fetch: Fetch) {
        self.records.push(fetch);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Arithmetic mean of every recorded batch.
    pub fn mean(&self) -> Result<EvalResult> {
        if self.records.is_empty() {
            return Err(Error::EmptyEvaluation);
        }
        let n = self.records.len() as f32;
        let sum = |f: fn(&Fetch) -> f32| self.records.iter().map(f).sum::<f32>() / n;
        Ok(EvalResult {
            loss: sum(|r| r.loss),
            top1: sum(|r| r.top1),
            top5: sum(|r| r.top5),
            batches: self.records.len(),
        })
    }
}

/// True after every `log_interval`-th completed iteration (0-based `iter`).
fn is_log_step(iter: usize, log_interval: usize) -> bool {
    log_interval > 0 && (iter + 1) % log_interval == 0
}

fn progress_bar(len: usize) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    let style = ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("#>-");
    pb.set_style(style);
    pb
}

/// Runs training steps until `stop_iter` iterations (if set) or the end of
/// `loader`. Returns the mean of the per-step metrics, or an all-zero result
/// with `batches == 0` when the loader yields nothing.
pub fn train(
    exe: &Executor,
    program: &Program,
    loader: &mut DataLoader,
    stop_iter: Option<usize>,
    log_interval: usize,
) -> Result<EvalResult> {
    loader.reset();
    let pb = stop_iter.is_none().then(|| progress_bar(loader.num_batches()));
    let mut metrics = MetricsAccumulator::new();

    let limit = stop_iter.unwrap_or(usize::MAX);
    for (iter, batch) in loader.by_ref().take(limit).enumerate() {
        let fetch = exe.run(program, &batch)?;
        metrics.push(fetch);

        if is_log_step(iter, log_interval) {
            info!(
                iter = iter + 1,
                loss = fetch.loss,
                top1 = fetch.top1,
                top5 = fetch.top5,
                "train"
            );
        }
        if let Some(pb) = &pb {
            pb.set_message(format!("loss {:.4}", fetch.loss));
            pb.inc(1);
        }
    }

    if let Some(pb) = pb {
        pb.finish_and_clear();
    }
    if metrics.is_empty() {
        warn!("training loader yielded no batches");
        return Ok(EvalResult::default());
    }
    metrics.mean()
}

/// Forward-only pass over `loader` with the inference variant of `program`.
pub fn evaluate(
    exe: &Executor,
    program: &Program,
    loader: &mut DataLoader,
    stop_iter: Option<usize>,
    log_interval: usize,
) -> Result<EvalResult> {
    let program = if program.is_for_test() {
        program.clone()
    } else {
        program.clone_for_test()
    };
    loader.reset();
    let mut metrics = MetricsAccumulator::new();

    let limit = stop_iter.unwrap_or(usize::MAX);
    for (iter, batch) in loader.by_ref().take(limit).enumerate() {
        let fetch = exe.run(&program, &batch)?;
        metrics.push(fetch);
        if is_log_step(iter, log_interval) {
            info!(iter = iter + 1, loss = fetch.loss, top1 = fetch.top1, "eval");
        }
    }

    let result = metrics.mean()?;
    info!(
        kind = ?program.kind(),
        batches = result.batches,
        loss = result.loss,
        top1 = result.top1,
        top5 = result.top5,
        "evaluation finished"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MnistDataset;
    use crate::nn::{Flatten, Linear, Sequential};
    use crate::optim::Momentum;
    use crate::program::Place;
    use crate::scope::Scope;

    fn fetch(loss: f32, top1: f32, top5: f32) -> Fetch {
        Fetch { loss, top1, top5 }
    }

    fn program(scope: &Scope) -> Program {
        let net = Sequential::new(
            "linear",
            vec![
                Box::new(Flatten::new("flatten")),
                Box::new(Linear::new(scope, "fc7", 28 * 28, 3, true).unwrap()),
            ],
        );
        let mut program = Program::new(Box::new(net), scope.clone(), [1, 28, 28]);
        let params = program.parameters();
        program.minimize(Box::new(Momentum::new(params, 5e-4, 0.9)));
        program
    }

    #[test]
    fn test_accumulator_means_and_empty() {
        let mut acc = MetricsAccumulator::new();
        assert!(matches!(acc.mean(), Err(Error::EmptyEvaluation)));
        acc.push(fetch(2.0, 0.5, 1.0));
        acc.push(fetch(1.0, 0.25, 0.5));
        let mean = acc.mean().unwrap();
        assert_eq!(mean.batches, 2);
        assert!((mean.loss - 1.5).abs() < 1e-6);
        assert!((mean.top1 - 0.375).abs() < 1e-6);
        assert!((mean.top5 - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_logs_after_each_full_interval() {
        let logged: Vec<usize> = (0..250).filter(|&i| is_log_step(i, 100)).collect();
        assert_eq!(logged, vec![99, 199]);
        assert!(is_log_step(0, 1));
        assert!(!(0..10).any(|i| is_log_step(i, 0)));
    }

    #[test]
    fn test_stop_iter_caps_both_loops() {
        let scope = Scope::new(4);
        let program = program(&scope);
        let exe = Executor::new(Place::Cpu).unwrap();
        let mut loader = DataLoader::new(MnistDataset::synthetic(40, 3, 1), 4, true).unwrap();

        let trained = train(&exe, &program, &mut loader, Some(3), 1).unwrap();
        assert_eq!(trained.batches, 3);
        let eval = evaluate(&exe, &program, &mut loader, Some(2), 0).unwrap();
        assert_eq!(eval.batches, 2);
        let full = evaluate(&exe, &program, &mut loader, None, 0).unwrap();
        assert_eq!(full.batches, 10);
        assert!((0.0..=1.0).contains(&full.top1));
        assert!(full.top5 >= full.top1);
    }

    #[test]
    fn test_training_lowers_eval_loss() {
        let scope = Scope::new(4);
        let program = program(&scope);
        let exe = Executor::new(Place::Cpu).unwrap();
        let mut train_loader =
            DataLoader::new(MnistDataset::synthetic(60, 3, 2), 6, true).unwrap();
        let mut test_loader = DataLoader::new(MnistDataset::synthetic(30, 3, 3), 6, false).unwrap();

        let before = evaluate(&exe, &program, &mut test_loader, None, 0).unwrap();
        for _ in 0..5 {
            train(&exe, &program, &mut train_loader, None, 0).unwrap();
        }
        let after = evaluate(&exe, &program, &mut test_loader, None, 0).unwrap();
        assert!(after.loss < before.loss, "{} -> {}", before.loss, after.loss);
        // top-5 over three classes is always a hit
        assert_eq!(after.top5, 1.0);
    }

    #[test]
    fn test_empty_loader_skips_training_but_fails_evaluation() {
        let scope = Scope::new(4);
        let program = program(&scope);
        let exe = Executor::new(Place::Cpu).unwrap();
        let mut loader = DataLoader::new(MnistDataset::synthetic(4, 3, 1), 8, true).unwrap();
        let weights = scope.parameter("fc7_weights").unwrap().tensor.data().clone();

        let trained = train(&exe, &program, &mut loader, None, 1).unwrap();
        assert_eq!(trained, EvalResult::default());
        assert_eq!(*scope.parameter("fc7_weights").unwrap().tensor.data(), weights);

        assert!(matches!(
            evaluate(&exe, &program, &mut loader, None, 0),
            Err(Error::EmptyEvaluation)
        ));
    }
}
