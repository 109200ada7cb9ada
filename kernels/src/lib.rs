//! Compute kernels invoked by the image workers.
//!
//! The worker only depends on the [`ComputeKernel`] contract: a tightly packed,
//! interleaved pixel buffer goes in, a buffer of the same length comes out
//! together with the time the kernel spent on it.

pub mod error;
pub mod gpu;
pub mod kernel;
pub mod laplacian;

pub use error::{KernelError, Result};
pub use gpu::GpuProcessor;
pub use kernel::{ComputeKernel, KernelOutput};
pub use laplacian::LaplacianProcessor;
