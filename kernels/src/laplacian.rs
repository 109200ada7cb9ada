use std::time::Instant;

use async_trait::async_trait;
use bytemuck::{Pod, Zeroable};

use crate::error::{KernelError, Result};
use crate::gpu::GpuProcessor;
use crate::kernel::{check_layout, ComputeKernel, KernelOutput};

const WORKGROUP_SIZE: u32 = 8;

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct Params {
    width: u32,
    height: u32,
    channels: u32,
    _padding: u32,
}

/// Laplacian edge detection on the GPU.
///
/// Each sample is widened to a `u32` so invocations never share a word in
/// the output buffer.
pub struct LaplacianProcessor {
    gpu: GpuProcessor,
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
}

impl LaplacianProcessor {
    pub async fn new() -> Result<Self> {
        let gpu = GpuProcessor::new().await?;

        let bind_group_layout =
            gpu.device
                .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    entries: &[
                        storage_entry(0, true),
                        storage_entry(1, false),
                        wgpu::BindGroupLayoutEntry {
                            binding: 2,
                            visibility: wgpu::ShaderStages::COMPUTE,
                            ty: wgpu::BindingType::Buffer {
                                ty: wgpu::BufferBindingType::Uniform,
                                has_dynamic_offset: false,
                                min_binding_size: None,
                            },
                            count: None,
                        },
                    ],
                    label: Some("laplacian_bind_group_layout"),
                });

        let shader = gpu
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("Laplacian Shader"),
                source: wgpu::ShaderSource::Wgsl(LAPLACIAN_SHADER.into()),
            });

        let pipeline_layout = gpu
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("Laplacian Pipeline Layout"),
                bind_group_layouts: &[&bind_group_layout],
                push_constant_ranges: &[],
            });

        let pipeline = gpu
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("Laplacian Pipeline"),
                layout: Some(&pipeline_layout),
                module: &shader,
                entry_point: "main",
            });

        Ok(Self {
            gpu,
            pipeline,
            bind_group_layout,
        })
    }

    pub async fn detect_edges(
        &self,
        image_data: &[u8],
        width: u32,
        height: u32,
        channels: u32,
    ) -> Result<Vec<u8>> {
        let samples = check_layout(image_data, width, height, channels)?;
        let buffer_size = (samples * std::mem::size_of::<u32>()) as u64;
        if buffer_size > self.gpu.max_storage_binding() {
            return Err(KernelError::InvalidInput(format!(
                "Image needs {} bytes of storage, device allows {}",
                buffer_size,
                self.gpu.max_storage_binding()
            )));
        }

        let widened = widen_samples(image_data);
        let input_buffer = self.gpu.create_buffer_init(
            bytemuck::cast_slice(&widened),
            wgpu::BufferUsages::STORAGE,
            "Laplacian Input Buffer",
        );
        let output_buffer = self.gpu.create_storage_buffer(buffer_size, "Laplacian Output Buffer");
        let staging_buffer = self.gpu.create_staging_buffer(buffer_size, "Laplacian Staging Buffer");

        let params = Params {
            width,
            height,
            channels,
            _padding: 0,
        };
        let params_buffer = self.gpu.create_buffer_init(
            bytemuck::bytes_of(&params),
            wgpu::BufferUsages::UNIFORM,
            "Laplacian Params Buffer",
        );

        let bind_group = self
            .gpu
            .device
            .create_bind_group(&wgpu::BindGroupDescriptor {
                layout: &self.bind_group_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: input_buffer.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: output_buffer.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: params_buffer.as_entire_binding(),
                    },
                ],
                label: Some("laplacian_bind_group"),
            });

        let mut encoder = self
            .gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Laplacian Encoder"),
            });

        {
            let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Laplacian Compute Pass"),
                timestamp_writes: None,
            });

            compute_pass.set_pipeline(&self.pipeline);
            compute_pass.set_bind_group(0, &bind_group, &[]);
            compute_pass.dispatch_workgroups(
                workgroup_count(width),
                workgroup_count(height),
                1,
            );
        }

        encoder.copy_buffer_to_buffer(&output_buffer, 0, &staging_buffer, 0, buffer_size);
        self.gpu.queue.submit(std::iter::once(encoder.finish()));

        let data = self.gpu.read_buffer(&staging_buffer).await?;
        Ok(narrow_samples(&data))
    }
}

#[async_trait]
impl ComputeKernel for LaplacianProcessor {
    async fn process(
        &self,
        input: &[u8],
        width: u32,
        height: u32,
        channels: u32,
    ) -> Result<KernelOutput> {
        let started = Instant::now();
        let pixels = self.detect_edges(input, width, height, channels).await?;
        let elapsed_ms = started.elapsed().as_secs_f32() * 1000.0;

        log::debug!(
            "Laplacian pass on {}x{}x{} took {:.2} ms",
            width,
            height,
            channels,
            elapsed_ms
        );

        Ok(KernelOutput { pixels, elapsed_ms })
    }
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn workgroup_count(extent: u32) -> u32 {
    (extent + WORKGROUP_SIZE - 1) / WORKGROUP_SIZE
}

fn widen_samples(data: &[u8]) -> Vec<u32> {
    data.iter().map(|&b| b as u32).collect()
}

fn narrow_samples(data: &[u8]) -> Vec<u8> {
    // Mapped bytes carry no u32 alignment guarantee
    data.chunks_exact(4)
        .map(|word| u32::from_ne_bytes([word[0], word[1], word[2], word[3]]).min(255) as u8)
        .collect()
}

const LAPLACIAN_SHADER: &str = r#"
struct Params {
    width: u32,
    height: u32,
    channels: u32,
    _padding: u32,
}

@group(0) @binding(0)
var<storage, read> src: array<u32>;
@group(0) @binding(1)
var<storage, read_write> dst: array<u32>;
@group(0) @binding(2)
var<uniform> params: Params;

fn sample_at(x: u32, y: u32, c: u32) -> i32 {
    return i32(src[(y * params.width + x) * params.channels + c]);
}

@compute @workgroup_size(8, 8, 1)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let x = id.x;
    let y = id.y;
    if (x >= params.width || y >= params.height) {
        return;
    }

    let base = (y * params.width + x) * params.channels;

    // No full neighbourhood on the border
    if (x == 0u || y == 0u || x + 1u >= params.width || y + 1u >= params.height) {
        for (var c = 0u; c < params.channels; c = c + 1u) {
            dst[base + c] = 0u;
        }
        return;
    }

    for (var c = 0u; c < params.channels; c = c + 1u) {
        let lap = sample_at(x - 1u, y, c) + sample_at(x + 1u, y, c)
            + sample_at(x, y - 1u, c) + sample_at(x, y + 1u, c)
            - 4 * sample_at(x, y, c);
        dst[base + c] = u32(clamp(abs(lap), 0, 255));
    }
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workgroup_count_rounds_up() {
        assert_eq!(workgroup_count(1), 1);
        assert_eq!(workgroup_count(8), 1);
        assert_eq!(workgroup_count(9), 2);
        assert_eq!(workgroup_count(1920), 240);
    }

    #[test]
    fn test_widen_then_narrow_preserves_samples() {
        let samples = vec![0u8, 17, 128, 255];
        let widened = widen_samples(&samples);
        assert_eq!(widened, vec![0, 17, 128, 255]);
        assert_eq!(narrow_samples(bytemuck::cast_slice(&widened)), samples);
    }

    #[test]
    fn test_narrow_saturates() {
        let words = [300u32, 42];
        assert_eq!(narrow_samples(bytemuck::cast_slice(&words)), vec![255, 42]);
    }

    #[test]
    fn test_params_layout_is_uniform_sized() {
        assert_eq!(std::mem::size_of::<Params>(), 16);
    }
}
