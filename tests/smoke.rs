use quantcheck::harness::{DataSource, RunMode};
use quantcheck::{HarnessConfig, QatWorkflow, Tape, Tensor};

#[inline]
fn s(t: &Tensor) -> f32 {
    t.data()[0]
}

macro_rules! g {
    ($t:expr) => {
        $t.grad().map(|t| t.data()[0]).unwrap_or(0.0)
    };
}

fn synthetic(train_samples: usize, test_samples: usize, classes: usize) -> DataSource {
    DataSource::Synthetic {
        train_samples,
        test_samples,
        classes,
        seed: 11,
    }
}

#[test]
fn compound_affine() {
    Tape::reset();
    let a = Tensor::scalar(2.0).requires_grad();
    let b = Tensor::scalar(3.0).requires_grad();
    let c = &(&a * &b) + &a; // c = a*b + a
    c.backward();

    assert!((s(&c) - 8.0).abs() < 1e-6);
    assert!((g!(a) - 4.0).abs() < 1e-6); // b + 1
    assert!((g!(b) - 2.0).abs() < 1e-6); // a
}

#[test]
fn matmul_t_shapes_and_grads() {
    Tape::reset();

    // [2x3] @ [2x3]^T -> [2x2]
    let a = Tensor::new(vec![1., 2., 3., 4., 5., 6.], &[2, 3]).requires_grad();
    let b = Tensor::new(vec![7., 9., 11., 8., 10., 12.], &[2, 3]).requires_grad();

    let c = a.matmul_t(&b);
    assert_eq!(c.shape(), &[2, 2]);
    c.backward();

    assert_eq!(a.grad().unwrap().shape(), &[2, 3]);
    assert_eq!(b.grad().unwrap().shape(), &[2, 3]);

    // expected C (row-major): [[58, 64], [139, 154]]
    let cd = c.data();
    assert!((cd[0] - 58.0).abs() < 1e-4);
    assert!((cd[3] - 154.0).abs() < 1e-4);
}

#[test]
fn smoke_workflow_runs_every_phase() {
    let mut config = HarnessConfig::for_mode(RunMode::Smoke);
    config.data = synthetic(128, 96, 10);
    config.model_scale = 0.25;

    let report = QatWorkflow::new(config).run().unwrap();

    for result in [&report.baseline_train, &report.before, &report.qat_train, &report.after] {
        assert_eq!(result.batches, 10);
        assert!((0.0..=1.0).contains(&result.top1));
        assert!((0.0..=1.0).contains(&result.top5));
        assert!(result.top5 >= result.top1);
        assert!(result.loss.is_finite());
    }

    // conv1 + 13 * (dw, sep) + fc7
    assert_eq!(report.quantized_layers.len(), 28);
    assert_eq!(report.pact_parameters.len(), 28);
    assert!(report.pact_parameters.iter().any(|p| p == "conv1_input_pact"));
    assert!(report.pact_parameters.iter().any(|p| p == "fc7_input_pact"));
}

#[test]
fn qat_keeps_top1_within_tolerance() {
    let mut config = HarnessConfig::for_mode(RunMode::Smoke);
    config.data = synthetic(640, 160, 2);
    config.model_scale = 0.25;
    config.float_iters = Some(80);
    config.eval_iters = None;

    let report = QatWorkflow::new(config).run().unwrap();
    assert!(report.before.top1 > 0.8, "baseline top1 {}", report.before.top1);
    report.check(0.1).unwrap();
}

#[test]
#[ignore = "downloads MNIST"]
fn mnist_accuracy_survives_quantization() {
    let config = HarnessConfig::from_env().unwrap();
    let tolerance = config.tolerance;
    let report = QatWorkflow::new(config).run().unwrap();
    report.check(tolerance).unwrap();
}
