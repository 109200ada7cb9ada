use actix_multipart::Multipart;
use actix_web::{web, HttpResponse};
use futures_util::TryStreamExt;
use image::{DynamicImage, ImageBuffer, ImageOutputFormat};
use serde::Serialize;
use std::io::Cursor;

use crate::client::{load_image_bytes, ClientPool, ProcessedImage};
use crate::error::{Result, ServiceError};
use crate::wire::RawImage;

/// Handles the edge detection endpoint
///
/// Accepts a multipart form with an image file, runs it through a worker and
/// returns the edge map as PNG. Kernel and worker timings come back as headers.
pub async fn detect_edges(payload: Multipart, clients: web::Data<ClientPool>) -> Result<HttpResponse> {
    let image_data = extract_file_from_multipart(payload).await?;
    let image = load_image_bytes(&image_data)?;
    let processed = clients.process(&image).await?;
    let png = encode_png(&processed.image)?;

    Ok(timing_headers(HttpResponse::Ok(), &processed)
        .content_type("image/png")
        .body(png))
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub service: String,
    pub version: String,
    pub clients: usize,
}

pub async fn health_check(clients: web::Data<ClientPool>) -> actix_web::Result<impl actix_web::Responder> {
    Ok(web::Json(HealthStatus {
        status: "healthy".to_string(),
        service: "laplacian-rpc".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        clients: clients.len(),
    }))
}

/// Extracts the `file` field from multipart form data
async fn extract_file_from_multipart(mut payload: Multipart) -> Result<Vec<u8>> {
    while let Some(mut field) = payload.try_next().await? {
        let content_disposition = field.content_disposition();

        if content_disposition.get_name() == Some("file") {
            let mut data = Vec::new();
            while let Some(chunk) = field.try_next().await? {
                data.extend_from_slice(&chunk);
            }

            if data.is_empty() {
                return Err(ServiceError::InvalidInput("Empty file provided".to_string()));
            }

            return Ok(data);
        }
    }

    Err(ServiceError::InvalidInput("No file field found in multipart data".to_string()))
}

fn timing_headers(
    mut builder: actix_web::HttpResponseBuilder,
    processed: &ProcessedImage,
) -> actix_web::HttpResponseBuilder {
    builder
        .insert_header(("X-Kernel-Time-Ms", format!("{:.3}", processed.kernel_elapsed_ms)))
        .insert_header(("X-Worker-Time-Ms", format!("{:.3}", processed.worker_total_ms)))
        .insert_header(("X-Round-Trip-Ms", format!("{:.3}", processed.timings.round_trip_ms)));
    builder
}

/// Encodes a raw 1, 3 or 4 channel buffer as PNG
fn encode_png(image: &RawImage) -> Result<Vec<u8>> {
    let dims = image.dims();
    let pixels = image.pixels().to_vec();
    let bad_layout = || ServiceError::InvalidInput(format!("Cannot encode {} channel image", dims.channels()));

    let dynamic = match dims.channels() {
        1 => ImageBuffer::from_raw(dims.width(), dims.height(), pixels).map(DynamicImage::ImageLuma8),
        3 => ImageBuffer::from_raw(dims.width(), dims.height(), pixels).map(DynamicImage::ImageRgb8),
        4 => ImageBuffer::from_raw(dims.width(), dims.height(), pixels).map(DynamicImage::ImageRgba8),
        _ => None,
    }
    .ok_or_else(bad_layout)?;

    let mut output = Vec::new();
    dynamic.write_to(&mut Cursor::new(&mut output), ImageOutputFormat::Png)?;
    Ok(output)
}
