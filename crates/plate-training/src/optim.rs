//! Averaged stochastic gradient descent.
//!
//! Each parameter decays its own step size as
//! `eta = lr / (1 + lambd * lr * n)^alpha` and keeps a running average of
//! its values once `n` passes `t0`.

use burn::{
    config::Config,
    module::AutodiffModule,
    optim::{adaptor::OptimizerAdaptor, SimpleOptimizer},
    record::Record,
    tensor::{
        backend::{AutodiffBackend, Backend},
        Tensor,
    },
    LearningRate,
};
use plate_core::AsgdParams;

/// Configuration for [`Asgd`]
#[derive(Config, Debug)]
pub struct AsgdConfig {
    /// Decay term
    #[config(default = 1e-4)]
    pub lambd: f64,
    /// Power for the eta update
    #[config(default = 0.75)]
    pub alpha: f64,
    /// Point at which averaging starts
    #[config(default = 1e6)]
    pub t0: f64,
    /// L2 penalty added to the gradient
    #[config(default = 0.0)]
    pub weight_decay: f64,
}

impl From<AsgdParams> for AsgdConfig {
    fn from(params: AsgdParams) -> Self {
        Self::new()
            .with_lambd(params.lambd)
            .with_alpha(params.alpha)
            .with_t0(params.t0)
            .with_weight_decay(params.weight_decay)
    }
}

impl AsgdConfig {
    /// Optimizer for a module trained on an autodiff backend
    pub fn init<B: AutodiffBackend, M: AutodiffModule<B>>(
        &self,
    ) -> OptimizerAdaptor<Asgd, M, B> {
        OptimizerAdaptor::from(Asgd {
            lambd: self.lambd,
            alpha: self.alpha,
            t0: self.t0,
            weight_decay: self.weight_decay,
        })
    }
}

/// Averaged SGD update rule
#[derive(Clone, Debug)]
pub struct Asgd {
    lambd: f64,
    alpha: f64,
    t0: f64,
    weight_decay: f64,
}

/// Per-parameter state
#[derive(Record, Clone)]
pub struct AsgdState<B: Backend, const D: usize> {
    /// Number of updates applied so far
    pub step: usize,
    /// Running average of the parameter
    pub average: Tensor<B, D>,
}

impl Asgd {
    /// `(eta, mu)` for the update after `step` previous updates
    pub fn schedule(&self, lr: LearningRate, step: usize) -> (f64, f64) {
        let n = step as f64;
        let eta = lr / (1.0 + self.lambd * lr * n).powf(self.alpha);
        let mu = 1.0 / f64::max(1.0, n - self.t0);
        (eta, mu)
    }
}

impl<B: Backend> SimpleOptimizer<B> for Asgd {
    type State<const D: usize> = AsgdState<B, D>;

    fn step<const D: usize>(
        &self,
        lr: LearningRate,
        tensor: Tensor<B, D>,
        mut grad: Tensor<B, D>,
        state: Option<Self::State<D>>,
    ) -> (Tensor<B, D>, Option<Self::State<D>>) {
        let step = state.as_ref().map_or(0, |s| s.step);
        let (eta, mu) = self.schedule(lr, step);

        if self.weight_decay != 0.0 {
            grad = grad + tensor.clone().mul_scalar(self.weight_decay);
        }

        let tensor = tensor.mul_scalar(1.0 - self.lambd * eta) - grad.mul_scalar(eta);

        let average = match state {
            Some(state) if mu != 1.0 => {
                let average = state.average;
                average.clone() + (tensor.clone() - average).mul_scalar(mu)
            }
            _ => tensor.clone(),
        };

        let state = AsgdState {
            step: step + 1,
            average,
        };
        (tensor, Some(state))
    }

    fn to_device<const D: usize>(mut state: Self::State<D>, device: &B::Device) -> Self::State<D> {
        state.average = state.average.to_device(device);
        state
    }
}
