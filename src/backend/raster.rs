use std::path::Path;

use image::{ImageBuffer, Luma, imageops};
use ndarray::{Array2, Array3};

use super::BackendError;

/// Decode a frame and convert it to grayscale `f32` in `0.0..=255.0`.
pub(super) fn load_gray(path: &Path) -> Result<Array2<f32>, BackendError> {
    let image = image::open(path)
        .map_err(|source| BackendError::Decode {
            path: path.to_path_buf(),
            source,
        })?
        .to_luma8();
    let (width, height) = image.dimensions();
    Ok(Array2::from_shape_fn(
        (height as usize, width as usize),
        |(y, x)| f32::from(image.get_pixel(x as u32, y as u32)[0]),
    ))
}

#[inline]
fn clamp_index(value: isize, len: usize) -> usize {
    value.clamp(0, len as isize - 1) as usize
}

/// Gaussian blur through `imageops::blur` on an `f32` luma buffer.
pub(super) fn gaussian_blur(src: &Array2<f32>, sigma: f32) -> Array2<f32> {
    let (height, width) = src.dim();
    let buffer: ImageBuffer<Luma<f32>, Vec<f32>> =
        ImageBuffer::from_fn(width as u32, height as u32, |x, y| {
            Luma([src[(y as usize, x as usize)]])
        });
    let blurred = imageops::blur(&buffer, sigma);
    Array2::from_shape_fn((height, width), |(y, x)| {
        blurred.get_pixel(x as u32, y as u32)[0]
    })
}

/// Per-channel box filter of side `window` with replicated borders.
pub(super) fn box_blur(src: &Array3<f32>, window: usize) -> Array3<f32> {
    let radius = (window / 2) as isize;
    let norm = 1.0 / (2 * radius + 1) as f32;
    let (height, width, channels) = src.dim();
    let horizontal = Array3::from_shape_fn((height, width, channels), |(y, x, c)| {
        (-radius..=radius)
            .map(|k| src[(y, clamp_index(x as isize + k, width), c)])
            .sum::<f32>()
            * norm
    });
    Array3::from_shape_fn((height, width, channels), |(y, x, c)| {
        (-radius..=radius)
            .map(|k| horizontal[(clamp_index(y as isize + k, height), x, c)])
            .sum::<f32>()
            * norm
    })
}

/// Bilinear resize; pixel centres are aligned.
///
/// Also used to upsample signed flow channels, where every output must be a
/// plain two-tap interpolation of its neighbours.
pub(super) fn resize(src: &Array2<f32>, height: usize, width: usize) -> Array2<f32> {
    let (src_h, src_w) = src.dim();
    let scale_x = src_w as f32 / width as f32;
    let scale_y = src_h as f32 / height as f32;
    Array2::from_shape_fn((height, width), |(y, x)| {
        let sx = ((x as f32 + 0.5) * scale_x - 0.5).clamp(0.0, (src_w - 1) as f32);
        let sy = ((y as f32 + 0.5) * scale_y - 0.5).clamp(0.0, (src_h - 1) as f32);
        let x0 = sx.floor() as usize;
        let y0 = sy.floor() as usize;
        let x1 = (x0 + 1).min(src_w - 1);
        let y1 = (y0 + 1).min(src_h - 1);
        let fx = sx - x0 as f32;
        let fy = sy - y0 as f32;
        let top = src[(y0, x0)] * (1.0 - fx) + src[(y0, x1)] * fx;
        let bottom = src[(y1, x0)] * (1.0 - fx) + src[(y1, x1)] * fx;
        top * (1.0 - fy) + bottom * fy
    })
}

/// Bilinear sample of every channel at `(x, y)`.
///
/// Returns `None` unless all four neighbours lie inside the raster.
pub(super) fn sample<const N: usize>(src: &Array3<f32>, x: f32, y: f32) -> Option<[f32; N]> {
    let (height, width, _) = src.dim();
    if !(x >= 0.0 && y >= 0.0) {
        return None;
    }
    let x0 = x.floor() as usize;
    let y0 = y.floor() as usize;
    if x0 + 1 >= width || y0 + 1 >= height {
        return None;
    }
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;
    let mut out = [0.0; N];
    for (c, value) in out.iter_mut().enumerate() {
        let top = src[(y0, x0, c)] * (1.0 - fx) + src[(y0, x0 + 1, c)] * fx;
        let bottom = src[(y0 + 1, x0, c)] * (1.0 - fx) + src[(y0 + 1, x0 + 1, c)] * fx;
        *value = top * (1.0 - fy) + bottom * fy;
    }
    Some(out)
}
