pub mod activation;
pub mod conv;
pub mod data;
pub mod error;
pub mod gemm;
pub mod harness;
pub mod loss;
pub mod mobilenet;
pub mod nn;
pub mod norm;
pub mod ops;
pub mod optim;
pub mod pool;
pub mod program;
pub mod quantization;
pub mod scope;
pub mod tape;
pub mod tensor;
pub mod train;

pub use error::{Error, Result};
pub use gemm::{sgemm_rowmajor, Trans};
pub use harness::{AccuracyComparison, HarnessConfig, QatReport, QatWorkflow};
pub use program::{Executor, Fetch, Place, Program, ProgramKind};
pub use quantization::QuantConfig;
pub use tape::{no_grad, Tape};
pub use tensor::Tensor;
pub use train::{evaluate, train, EvalResult};
