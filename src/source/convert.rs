use crate::error::SourceError;
use crate::frame::{ConvertedFrame, PixelFormat, RawFrame, RawPixelFormat};

/// Convert a sensor-native frame into a packed target frame.
///
/// Row padding (`stride` beyond the packed row) is stripped. Colour inputs become
/// BT.601 luma for `Gray8`; grey inputs are replicated across channels for `Rgb8`.
pub fn convert_frame(raw: &RawFrame, target: PixelFormat) -> Result<ConvertedFrame, SourceError> {
    let pixels = convert_pixels(
        raw.data(),
        raw.width,
        raw.height,
        raw.stride,
        raw.format,
        target,
    )?;
    Ok(ConvertedFrame::new(pixels, raw.width, raw.height, target))
}

pub(crate) fn convert_pixels(
    data: &[u8],
    width: u32,
    height: u32,
    stride: usize,
    format: RawPixelFormat,
    target: PixelFormat,
) -> Result<Vec<u8>, SourceError> {
    let unsupported = |reason: String| SourceError::UnsupportedConversion {
        from: format.to_string(),
        to: target,
        reason,
    };

    if width == 0 || height == 0 {
        return Err(unsupported("empty frame".to_string()));
    }
    let row_bytes = format.packed_row_bytes(width);
    if stride < row_bytes {
        return Err(unsupported(format!(
            "stride {} shorter than row of {} bytes",
            stride, row_bytes
        )));
    }
    if matches!(format, RawPixelFormat::Yuyv | RawPixelFormat::Nv12) && width % 2 != 0 {
        return Err(unsupported(format!("odd width {} for chroma subsampling", width)));
    }
    if format == RawPixelFormat::Nv12 && height % 2 != 0 {
        return Err(unsupported(format!("odd height {} for NV12", height)));
    }

    let w = width as usize;
    let h = height as usize;
    let luma_rows = stride
        .checked_mul(h)
        .ok_or_else(|| unsupported("frame dimensions overflow".to_string()))?;
    let required = match format {
        RawPixelFormat::Nv12 => luma_rows + stride * (h / 2),
        _ => luma_rows,
    };
    if data.len() < required {
        return Err(unsupported(format!(
            "frame length mismatch: expected at least {}, got {}",
            required,
            data.len()
        )));
    }

    let out_len = target
        .frame_len(width, height)
        .ok_or_else(|| unsupported("frame dimensions overflow".to_string()))?;
    let mut out = Vec::with_capacity(out_len);

    for j in 0..h {
        let row = &data[j * stride..j * stride + row_bytes];
        match (format, target) {
            (RawPixelFormat::Mono8, PixelFormat::Gray8) => out.extend_from_slice(row),
            (RawPixelFormat::Mono8, PixelFormat::Rgb8) => {
                for &y in row {
                    out.extend_from_slice(&[y, y, y]);
                }
            }
            (RawPixelFormat::Mono16, _) => {
                for px in row.chunks_exact(2) {
                    push_gray(&mut out, px[1], target);
                }
            }
            (RawPixelFormat::Rgb24, PixelFormat::Rgb8) => out.extend_from_slice(row),
            (RawPixelFormat::Rgb24, PixelFormat::Gray8) => {
                for px in row.chunks_exact(3) {
                    out.push(luma(px[0], px[1], px[2]));
                }
            }
            (RawPixelFormat::Bgr24, PixelFormat::Rgb8) => {
                for px in row.chunks_exact(3) {
                    out.extend_from_slice(&[px[2], px[1], px[0]]);
                }
            }
            (RawPixelFormat::Bgr24, PixelFormat::Gray8) => {
                for px in row.chunks_exact(3) {
                    out.push(luma(px[2], px[1], px[0]));
                }
            }
            (RawPixelFormat::Yuyv, PixelFormat::Gray8) => {
                for px in row.chunks_exact(2) {
                    out.push(px[0]);
                }
            }
            (RawPixelFormat::Yuyv, PixelFormat::Rgb8) => {
                for quad in row.chunks_exact(4) {
                    let (u, v) = (quad[1], quad[3]);
                    out.extend_from_slice(&yuv_to_rgb(quad[0], u, v));
                    out.extend_from_slice(&yuv_to_rgb(quad[2], u, v));
                }
            }
            (RawPixelFormat::Nv12, PixelFormat::Gray8) => out.extend_from_slice(row),
            (RawPixelFormat::Nv12, PixelFormat::Rgb8) => {
                let uv_row = luma_rows + (j / 2) * stride;
                for (i, &y) in row.iter().enumerate() {
                    let uv_index = uv_row + (i / 2) * 2;
                    out.extend_from_slice(&yuv_to_rgb(y, data[uv_index], data[uv_index + 1]));
                }
            }
        }
    }

    debug_assert_eq!(out.len(), out_len);
    Ok(out)
}

fn push_gray(out: &mut Vec<u8>, y: u8, target: PixelFormat) {
    match target {
        PixelFormat::Gray8 => out.push(y),
        PixelFormat::Rgb8 => out.extend_from_slice(&[y, y, y]),
    }
}

/// BT.601 luma in fixed point.
fn luma(r: u8, g: u8, b: u8) -> u8 {
    ((77 * r as u32 + 150 * g as u32 + 29 * b as u32 + 128) >> 8) as u8
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = y as f32;
    let u = u as f32 - 128.0;
    let v = v as f32 - 128.0;

    let r = y + 1.402_f32 * v;
    let g = y - 0.344_136_f32 * u - 0.714_136_f32 * v;
    let b = y + 1.772_f32 * u;

    [clamp_to_u8(r), clamp_to_u8(g), clamp_to_u8(b)]
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}
