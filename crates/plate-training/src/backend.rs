//! Backend selection.
//!
//! CPU (`NdArray`) by default; the `cuda` feature switches to Burn's CUDA
//! backend.

use burn::backend::Autodiff;

#[cfg(not(feature = "cuda"))]
pub type DefaultBackend = burn::backend::NdArray<f32>;

#[cfg(feature = "cuda")]
pub type DefaultBackend = burn::backend::Cuda;

/// Backend used for fitting
pub type TrainingBackend = Autodiff<DefaultBackend>;

/// Device of the default backend
pub fn default_device() -> <DefaultBackend as burn::tensor::backend::Backend>::Device {
    Default::default()
}

/// Human-readable name of the compiled backend
pub fn backend_name() -> &'static str {
    #[cfg(feature = "cuda")]
    {
        "CUDA (GPU)"
    }
    #[cfg(not(feature = "cuda"))]
    {
        "NdArray (CPU)"
    }
}
