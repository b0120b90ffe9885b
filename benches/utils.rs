use half::f16;
use rand::Rng;

/// GEMM FLOP count (multiply-add = 2 ops)
pub fn gemm_flops(m: usize, n: usize, k: usize) -> u64 {
    2 * m as u64 * n as u64 * k as u64
}

/// Random f16 activations in [-1.0, 1.0)
pub fn random_f16_vec(n: usize) -> Vec<f16> {
    let mut rng = rand::thread_rng();
    (0..n).map(|_| f16::from_f32(rng.gen_range(-1.0..1.0))).collect()
}

/// Random f16 scales in (0.001, 0.1)
pub fn random_scale_vec(n: usize) -> Vec<f16> {
    let mut rng = rand::thread_rng();
    (0..n).map(|_| f16::from_f32(rng.gen_range(0.001..0.1))).collect()
}

/// Random signed quantized values in the range of `bits`
pub fn random_quant_values(n: usize, bits: u32) -> Vec<i8> {
    let mut rng = rand::thread_rng();
    let (lo, hi) = if bits == 4 { (-8i8, 7i8) } else { (i8::MIN, i8::MAX) };
    (0..n).map(|_| rng.gen_range(lo..=hi)).collect()
}
