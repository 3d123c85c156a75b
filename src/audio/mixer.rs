// src/audio/mixer.rs
// SIMD-accelerated additive mixing used when laying clicks into a measure

use wide::f32x4;

/// Add `src * gain` into `dest` (SIMD). Mixes `min(dest.len(), src.len())` samples.
#[inline]
pub fn add_scaled(dest: &mut [f32], src: &[f32], gain: f32) {
    let gain_vec = f32x4::splat(gain);
    let len = dest.len().min(src.len());
    let chunks = len / 4;

    for i in 0..chunks {
        let idx = i * 4;

        let dest_vec = f32x4::new([dest[idx], dest[idx + 1], dest[idx + 2], dest[idx + 3]]);
        let src_vec = f32x4::new([src[idx], src[idx + 1], src[idx + 2], src[idx + 3]]);

        let result = dest_vec + (src_vec * gain_vec);
        dest[idx..idx + 4].copy_from_slice(&result.to_array());
    }

    // Handle remainder
    for i in chunks * 4..len {
        dest[i] += src[i] * gain;
    }
}

/// Add `src` into `dest` starting at `offset`, wrapping past the end of
/// `dest` back to its start. This is what keeps a click that rings across the
/// bar line audible at the top of the next loop iteration.
pub fn mix_wrapped(dest: &mut [f32], src: &[f32], offset: usize) {
    let len = dest.len();
    if len == 0 {
        return;
    }

    let mut position = offset % len;
    let mut rest = src;
    while !rest.is_empty() {
        let take = (len - position).min(rest.len());
        add_scaled(&mut dest[position..position + take], &rest[..take], 1.0);
        rest = &rest[take..];
        position = 0;
    }
}

/// Hard limit at ±1.0 (SIMD).
pub fn clamp_unit(buffer: &mut [f32]) {
    let one = f32x4::splat(1.0);
    let neg_one = f32x4::splat(-1.0);
    let chunks = buffer.len() / 4;

    for i in 0..chunks {
        let idx = i * 4;
        let vec = f32x4::new([
            buffer[idx],
            buffer[idx + 1],
            buffer[idx + 2],
            buffer[idx + 3],
        ]);
        buffer[idx..idx + 4].copy_from_slice(&vec.max(neg_one).min(one).to_array());
    }

    for item in buffer.iter_mut().skip(chunks * 4) {
        *item = item.clamp(-1.0, 1.0);
    }
}
