use thiserror::Error;

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("GPU error: {0}")]
    GpuError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Buffer error: {0}")]
    BufferError(String),
}

pub type Result<T> = std::result::Result<T, KernelError>;

impl From<wgpu::RequestDeviceError> for KernelError {
    fn from(err: wgpu::RequestDeviceError) -> Self {
        KernelError::GpuError(format!("Failed to request device: {}", err))
    }
}

impl From<wgpu::BufferAsyncError> for KernelError {
    fn from(err: wgpu::BufferAsyncError) -> Self {
        KernelError::GpuError(format!("Buffer async error: {}", err))
    }
}
