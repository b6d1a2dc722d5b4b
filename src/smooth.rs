//! Input smoothing for noisy or dithered sources.
//!
//! Each sample is replaced by a weighted average of itself and its 8 neighbours (edges are
//! clamped). With `SF = factor / 1024` the centre weighs `1 - 8 * SF` and every neighbour `SF`,
//! the same fixed-point scheme libjpeg uses for `smoothing_factor`.

/// Smooths interleaved 8-bit samples with `channels` samples per pixel.
///
/// `factor` is the libjpeg smoothing factor, `0..=100`; 0 returns the input unchanged.
pub fn smooth(data: &[u8], width: u32, height: u32, channels: usize, factor: u8) -> Vec<u8> {
    let factor = factor.min(100);
    if factor == 0 || width < 3 || height < 3 {
        return data.to_vec();
    }

    let width = width as usize;
    let height = height as usize;
    let sf = i32::from(factor);
    let memberscale = 65536 - sf * 512;
    let neighscale = sf * 64;

    let sample = |y: usize, x: usize, c: usize| i32::from(data[(y * width + x) * channels + c]);

    let mut output = vec![0u8; data.len()];
    for y in 0..height {
        let above = y.saturating_sub(1);
        let below = (y + 1).min(height - 1);
        for x in 0..width {
            let left = x.saturating_sub(1);
            let right = (x + 1).min(width - 1);
            for c in 0..channels {
                let neighbours = sample(above, left, c)
                    + sample(above, x, c)
                    + sample(above, right, c)
                    + sample(y, left, c)
                    + sample(y, right, c)
                    + sample(below, left, c)
                    + sample(below, x, c)
                    + sample(below, right, c);
                let v = (sample(y, x, c) * memberscale + neighbours * neighscale + 32768) >> 16;
                output[(y * width + x) * channels + c] = v.clamp(0, 255) as u8;
            }
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_factor_is_identity() {
        let data: Vec<u8> = (0..27).collect();
        assert_eq!(smooth(&data, 3, 3, 3, 0), data);
    }

    #[test]
    fn uniform_input_is_unchanged() {
        let data = vec![128u8; 4 * 4 * 4];
        assert_eq!(smooth(&data, 4, 4, 4, 50), data);
    }

    #[test]
    fn checkerboard_variance_drops() {
        let mut data = vec![0u8; 64];
        for y in 0..8 {
            for x in 0..8 {
                data[y * 8 + x] = if (x + y) % 2 == 0 { 255 } else { 0 };
            }
        }
        let result = smooth(&data, 8, 8, 1, 50);
        let variance = |d: &[u8]| -> i64 { d.iter().map(|&v| (i64::from(v) - 128).pow(2)).sum() };
        assert!(variance(&result) < variance(&data));
    }

    #[test]
    fn channels_are_independent() {
        // Red noise, flat green.
        let mut data = vec![0u8; 5 * 5 * 2];
        for (i, px) in data.chunks_exact_mut(2).enumerate() {
            px[0] = if i % 2 == 0 { 200 } else { 0 };
            px[1] = 77;
        }
        let result = smooth(&data, 5, 5, 2, 100);
        assert!(result.chunks_exact(2).all(|px| px[1] == 77));
        assert_ne!(result, data);
    }

    #[test]
    fn small_images_pass_through() {
        let data = vec![1, 2, 3, 4];
        assert_eq!(smooth(&data, 2, 2, 1, 100), data);
    }
}
