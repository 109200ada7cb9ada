use async_trait::async_trait;

use crate::error::{KernelError, Result};

/// Result of one kernel invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelOutput {
    /// Output samples, same layout and length as the input.
    pub pixels: Vec<u8>,
    /// Time reported by the kernel itself, in milliseconds.
    pub elapsed_ms: f32,
}

/// A compute capability that transforms a raw pixel buffer.
///
/// Buffers are interleaved per pixel and row-major, with rows exactly
/// `width * channels` bytes long.
#[async_trait]
pub trait ComputeKernel: Send + Sync {
    async fn process(
        &self,
        input: &[u8],
        width: u32,
        height: u32,
        channels: u32,
    ) -> Result<KernelOutput>;
}

/// Checks that `input` is a tightly packed `width x height x channels` buffer.
pub fn check_layout(input: &[u8], width: u32, height: u32, channels: u32) -> Result<usize> {
    if width == 0 || height == 0 || channels == 0 {
        return Err(KernelError::InvalidInput(format!(
            "Dimensions must be positive, got {}x{}x{}",
            width, height, channels
        )));
    }

    let expected = width as usize * height as usize * channels as usize;
    if input.len() != expected {
        return Err(KernelError::InvalidInput(format!(
            "Buffer holds {} bytes, expected {} for {}x{}x{}",
            input.len(),
            expected,
            width,
            height,
            channels
        )));
    }

    Ok(expected)
}
