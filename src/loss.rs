use crate::tape::Tape;
use crate::Tensor;

fn log_softmax_row(row: &[f32]) -> Vec<f32> {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let log_sum = row.iter().map(|&v| (v - max).exp()).sum::<f32>().ln() + max;
    row.iter().map(|&v| v - log_sum).collect()
}

/// Softmax cross entropy over `[batch, classes]` logits (mean reduction).
/// L = -mean( log_softmax(x)[label] )
pub fn softmax_cross_entropy(logits: &Tensor, labels: &[usize]) -> Tensor {
    assert_eq!(logits.shape().len(), 2, "cross_entropy: logits must be 2D");
    let (batch, classes) = (logits.shape()[0], logits.shape()[1]);
    assert_eq!(
        batch,
        labels.len(),
        "cross_entropy: logits and labels must match in batch size"
    );
    assert!(
        labels.iter().all(|&l| l < classes),
        "cross_entropy: label out of range"
    );

    // forward
    let log_probs: Vec<Vec<f32>> = logits
        .data()
        .chunks(classes)
        .map(log_softmax_row)
        .collect();
    let total: f32 = log_probs
        .iter()
        .zip(labels)
        .map(|(row, &l)| -row[l])
        .sum();
    let mut out = Tensor::scalar(total / batch as f32);

    // backward
    if logits.requires_grad {
        out.requires_grad = true;
        let x = logits.clone();
        let out_clone = out.clone();
        let labels = labels.to_vec();

        Tape::push_unary_op(logits, &out, move || {
            if let Some(gout) = out_clone.grad_ref() {
                let g = gout[0] / batch as f32;
                // dL/dx = (softmax(x) - onehot(label)) / N
                let mut gx = Vec::with_capacity(batch * classes);
                for (row, &l) in log_probs.iter().zip(&labels) {
                    for (j, &lp) in row.iter().enumerate() {
                        let target = if j == l { 1.0 } else { 0.0 };
                        gx.push(g * (lp.exp() - target));
                    }
                }
                crate::ops::accumulate_grad(&x, &gx);
            }
        });
    }

    out
}

/// Fraction of rows whose label is among the `k` highest scores.
///
/// Ties resolve toward the lower class index; `k` is clamped to the class count.
pub fn accuracy(logits: &Tensor, labels: &[usize], k: usize) -> f32 {
    assert_eq!(logits.shape().len(), 2, "accuracy: logits must be 2D");
    let (batch, classes) = (logits.shape()[0], logits.shape()[1]);
    assert_eq!(batch, labels.len(), "accuracy: batch size mismatch");
    if batch == 0 {
        return 0.0;
    }
    let k = k.min(classes);

    let data = logits.data();
    let correct = data
        .chunks(classes)
        .zip(labels)
        .filter(|&(row, &label)| {
            // label is in the top k iff fewer than k classes rank above it
            let score = row[label];
            let ahead = row
                .iter()
                .enumerate()
                .filter(|&(j, &v)| v > score || (v == score && j < label))
                .count();
            ahead < k
        })
        .count();

    correct as f32 / batch as f32
}
