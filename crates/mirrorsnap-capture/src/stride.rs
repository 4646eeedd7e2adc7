//! Row-stride correction: raw, possibly row-padded frames → packed RGBA.
//!
//! Mirroring surfaces align each row, so `row_stride_bytes` may exceed
//! `pixel_stride_bytes * width`. [`correct`] removes that padding
//! ([`StridePolicy::Crop`]) or keeps it as extra columns
//! ([`StridePolicy::Widen`]). With no padding both give the same image.

use mirrorsnap_core::{CaptureError, CaptureResult, PackedImage, RawFrame, StridePolicy};

const RGBA_BYTES: usize = 4;

/// Pack `raw` into a [`PackedImage`] according to `policy`.
///
/// Pure and deterministic. The final row of a padded buffer may omit its
/// padding (platforms often do); any other shortfall is a
/// [`CaptureError::MalformedFrame`].
pub fn correct(raw: &RawFrame, policy: StridePolicy) -> CaptureResult<PackedImage> {
    let width = raw.width as usize;
    let height = raw.height as usize;
    let stride = raw.row_stride_bytes as usize;

    if width == 0 || height == 0 {
        return Err(CaptureError::malformed(format!("empty frame {}x{}", raw.width, raw.height)));
    }
    if raw.pixel_stride_bytes as usize != RGBA_BYTES {
        return Err(CaptureError::malformed(format!(
            "pixel stride {} (only 4-byte RGBA is supported)",
            raw.pixel_stride_bytes
        )));
    }
    let packed_row = width * RGBA_BYTES;
    if stride < packed_row {
        return Err(CaptureError::malformed(format!(
            "row stride {stride} shorter than a packed row of {packed_row} bytes"
        )));
    }
    let required = stride * (height - 1) + packed_row;
    if raw.pixel_buffer.len() < required {
        return Err(CaptureError::malformed(format!(
            "buffer holds {} bytes, geometry needs {required}",
            raw.pixel_buffer.len()
        )));
    }

    let padding = stride - packed_row;
    if padding == 0 {
        return Ok(PackedImage {
            pixels: raw.pixel_buffer[..packed_row * height].to_vec(),
            width: raw.width,
            height: raw.height,
        });
    }

    match policy {
        StridePolicy::Crop => Ok(PackedImage {
            pixels: copy_rows(&raw.pixel_buffer, stride, packed_row, height),
            width: raw.width,
            height: raw.height,
        }),
        StridePolicy::Widen => {
            let extra_columns = padding / RGBA_BYTES;
            let out_row = (width + extra_columns) * RGBA_BYTES;
            Ok(PackedImage {
                pixels: copy_rows(&raw.pixel_buffer, stride, out_row, height),
                width: raw.width + extra_columns as u32,
                height: raw.height,
            })
        }
    }
}

/// Copy `out_row` bytes from the start of each of `height` rows spaced
/// `stride` apart, zero-filling whatever a short final row lacks.
fn copy_rows(src: &[u8], stride: usize, out_row: usize, height: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(out_row * height);
    for row in 0..height {
        let start = row * stride;
        let end = (start + out_row).min(src.len());
        out.extend_from_slice(&src[start..end]);
        out.resize((row + 1) * out_row, 0);
    }
    out
}
