//! Pixel format conversion and scaling on packed buffers

use crate::{Error, Result};

/// Convert a compact I420 frame to packed BGR (BT.601, limited range)
pub fn i420_to_bgr(data: &[u8], width: usize, height: usize) -> Result<Vec<u8>> {
    let (cw, ch) = (width.div_ceil(2), height.div_ceil(2));
    let y_len = width * height;
    let c_len = cw * ch;
    if data.len() < y_len + 2 * c_len {
        return Err(Error::StageError(format!(
            "I420 buffer of {} bytes too short for {}x{}",
            data.len(),
            width,
            height
        )));
    }

    let (y_plane, rest) = data.split_at(y_len);
    let (u_plane, v_plane) = rest.split_at(c_len);

    let mut out = vec![0u8; y_len * 3];
    for row in 0..height {
        for col in 0..width {
            let c = (row / 2) * cw + col / 2;
            let y = y_plane[row * width + col] as i32 - 16;
            let u = u_plane[c] as i32 - 128;
            let v = v_plane[c] as i32 - 128;

            let r = (298 * y + 409 * v + 128) >> 8;
            let g = (298 * y - 100 * u - 208 * v + 128) >> 8;
            let b = (298 * y + 516 * u + 128) >> 8;

            let px = (row * width + col) * 3;
            out[px] = clamp(b);
            out[px + 1] = clamp(g);
            out[px + 2] = clamp(r);
        }
    }
    Ok(out)
}

/// Swap channels of a packed RGB buffer into compact BGR
pub fn rgb_to_bgr(data: &[u8], width: usize, height: usize, stride: usize) -> Result<Vec<u8>> {
    check_packed(data, width, height, stride)?;
    let mut out = Vec::with_capacity(width * height * 3);
    for row in data.chunks(stride).take(height) {
        for px in row[..width * 3].chunks_exact(3) {
            out.extend_from_slice(&[px[2], px[1], px[0]]);
        }
    }
    Ok(out)
}

/// Nearest-neighbour resize of a packed 3-byte-per-pixel buffer
pub fn scale_nearest(
    data: &[u8],
    width: usize,
    height: usize,
    stride: usize,
    target_width: usize,
    target_height: usize,
) -> Result<Vec<u8>> {
    check_packed(data, width, height, stride)?;
    if target_width == 0 || target_height == 0 {
        return Err(Error::StageError("scale target must be non-zero".to_string()));
    }

    let mut out = Vec::with_capacity(target_width * target_height * 3);
    for ty in 0..target_height {
        let sy = ty * height / target_height;
        let row = &data[sy * stride..];
        for tx in 0..target_width {
            let sx = tx * width / target_width;
            out.extend_from_slice(&row[sx * 3..sx * 3 + 3]);
        }
    }
    Ok(out)
}

fn check_packed(data: &[u8], width: usize, height: usize, stride: usize) -> Result<()> {
    if width == 0 || height == 0 {
        return Err(Error::StageError("empty frame".to_string()));
    }
    if stride < width * 3 || data.len() < stride * (height - 1) + width * 3 {
        return Err(Error::StageError(format!(
            "packed buffer of {} bytes (stride {}) too short for {}x{}",
            data.len(),
            stride,
            width,
            height
        )));
    }
    Ok(())
}

fn clamp(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_i420_black_and_white() {
        // 2x2: Y=16 is black, Y=235 is white, neutral chroma
        let black = i420_to_bgr(&[16, 16, 16, 16, 128, 128], 2, 2).unwrap();
        assert!(black.iter().all(|&b| b == 0));

        let white = i420_to_bgr(&[235, 235, 235, 235, 128, 128], 2, 2).unwrap();
        assert!(white.iter().all(|&b| b == 255));
    }

    #[test]
    fn test_i420_odd_dimensions() {
        // 3x1 -> chroma 2x1
        let out = i420_to_bgr(&[16, 16, 16, 128, 128, 128, 128], 3, 1).unwrap();
        assert_eq!(out.len(), 9);
    }

    #[test]
    fn test_i420_red_dominates_with_high_v() {
        let out = i420_to_bgr(&[81, 90, 240], 1, 1).unwrap();
        let (b, r) = (out[0], out[2]);
        assert!(r > 200);
        assert!(b < 50);
    }

    #[test]
    fn test_i420_short_buffer() {
        assert!(i420_to_bgr(&[0; 5], 2, 2).is_err());
    }

    #[test]
    fn test_rgb_to_bgr_with_padding() {
        let data = [1, 2, 3, 0, 4, 5, 6, 0];
        let out = rgb_to_bgr(&data, 1, 2, 4).unwrap();
        assert_eq!(out, vec![3, 2, 1, 6, 5, 4]);
    }

    #[test]
    fn test_scale_nearest_up_and_down() {
        // 2x1: red, blue (BGR)
        let data = [0, 0, 255, 255, 0, 0];
        let up = scale_nearest(&data, 2, 1, 6, 4, 2).unwrap();
        assert_eq!(up.len(), 4 * 2 * 3);
        assert_eq!(&up[0..3], &[0, 0, 255]);
        assert_eq!(&up[3..6], &[0, 0, 255]);
        assert_eq!(&up[6..9], &[255, 0, 0]);

        let down = scale_nearest(&up, 4, 2, 12, 2, 1).unwrap();
        assert_eq!(down, data.to_vec());
    }

    #[test]
    fn test_scale_rejects_zero_target() {
        assert!(scale_nearest(&[0, 0, 0], 1, 1, 3, 0, 1).is_err());
    }
}
