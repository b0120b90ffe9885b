//! Offline weight preprocessing for the mixed-precision GEMM kernels.
//!
//! Quantizers emit signed weights row-major as `[k, n / elements_per_byte]`
//! (rows walk the reduction dimension). The kernels want them in the layout
//! their tensor-core loads consume, with an unsigned bias and a register
//! order that makes int -> f16 conversion cheap. [`preprocess_weight`]
//! produces that layout; [`unpack_preprocessed_weight`] inverts it.
//!
//! Pipeline per layout family:
//!
//! | family                      | steps                                               |
//! |-----------------------------|-----------------------------------------------------|
//! | `RowMajor` (sm_70..sm_75)   | register re-layout                                  |
//! | `ColumnMajorTileInterleave` | row permute, transpose, column interleave, register |
//!
//! All word-level steps read bytes as little-endian `u32`, so the output is
//! identical on every host.

use rayon::prelude::*;

use crate::backend_trait::{BackendError, BackendResult};
use crate::gpu_types::{HostTensor, TensorDtype, TensorView};
use crate::types::{SmArch, WeightBits, WeightLayout};
use crate::validation::{
    check_contiguous, check_dtype, check_multiple_of, check_nonzero, check_placement, check_rank, Placement,
};

/// Repacks a raw quantized weight `[rows, cols / epb]` into the kernel layout
/// `[cols, rows / epb]` for `arch`.
pub fn preprocess_weight(quantized_weight: &HostTensor, bits: u32, arch: u32) -> BackendResult<HostTensor> {
    let bits = WeightBits::from_bits(bits)?;
    let arch = SmArch::new(arch)?;

    check_dtype(quantized_weight, "quantized_weight", TensorDtype::I8)?;
    check_placement(quantized_weight, "quantized_weight", Placement::Host)?;
    check_contiguous(quantized_weight, "quantized_weight")?;
    check_rank(quantized_weight, "quantized_weight", 2)?;

    let epb = bits.elements_per_byte();
    let rows = quantized_weight.shape()[0];
    let cols = quantized_weight.shape()[1] * epb;

    let packed = preprocess_weights_for_mixed_gemm(quantized_weight.as_bytes(), rows, cols, bits, arch)?;
    HostTensor::from_packed_bytes(&packed, &[cols, rows / epb])
}

/// Byte-level form of [`preprocess_weight`]. `src` holds `rows * cols`
/// quantized values packed row-major.
pub fn preprocess_weights_for_mixed_gemm(
    src: &[u8],
    rows: usize,
    cols: usize,
    bits: WeightBits,
    arch: SmArch,
) -> BackendResult<Vec<u8>> {
    let layout = arch.layout(bits);
    check_layout_dims(src.len(), rows, cols, bits, layout)?;

    let mut buf = src.to_vec();
    if let WeightLayout::ColumnMajorTileInterleave {
        rows_per_tile,
        columns_interleaved,
    } = layout
    {
        let permuted = permute_rows_for_ldmatrix(&to_words(&buf), rows, cols, bits);
        let transposed = subbyte_transpose(&from_words(&permuted), rows, cols, bits);
        let interleaved = interleave_column_major(
            &to_words(&transposed),
            rows,
            cols,
            bits,
            rows_per_tile,
            columns_interleaved,
        );
        buf = from_words(&interleaved);
    }
    add_bias_and_interleave_registers(&mut buf, bits);

    log::debug!(
        "preprocessed {}-bit weight [{rows}, {cols}] for {arch} ({layout:?})",
        bits.bits()
    );
    Ok(buf)
}

/// Inverts [`preprocess_weights_for_mixed_gemm`], returning the signed values
/// of the logical `[k, n]` matrix row-major.
pub fn unpack_preprocessed_weight(
    preprocessed: &[u8],
    k: usize,
    n: usize,
    bits: WeightBits,
    arch: SmArch,
) -> BackendResult<Vec<i8>> {
    let layout = arch.layout(bits);
    check_layout_dims(preprocessed.len(), k, n, bits, layout)?;

    let mut buf = preprocessed.to_vec();
    remove_bias_and_deinterleave_registers(&mut buf, bits);
    if let WeightLayout::ColumnMajorTileInterleave {
        rows_per_tile,
        columns_interleaved,
    } = layout
    {
        let deinterleaved = deinterleave_column_major(
            &to_words(&buf),
            k,
            n,
            bits,
            rows_per_tile,
            columns_interleaved,
        );
        let transposed = subbyte_transpose(&from_words(&deinterleaved), n, k, bits);
        let unpermuted = unpermute_rows_for_ldmatrix(&to_words(&transposed), k, n, bits);
        buf = from_words(&unpermuted);
    }
    Ok(unpack_weights(&buf, bits))
}

/// Packs signed quantized values row-major; int4 puts the even element in the
/// low nibble.
pub fn pack_weights(values: &[i8], bits: WeightBits) -> BackendResult<Vec<u8>> {
    if let Some(&bad) = values
        .iter()
        .find(|&&v| v < bits.min_value() || v > bits.max_value())
    {
        return Err(BackendError::InvalidConfig(format!(
            "value {bad} does not fit in {} bits",
            bits.bits()
        )));
    }
    match bits {
        WeightBits::Int8 => Ok(values.iter().map(|&v| v as u8).collect()),
        WeightBits::Int4 => {
            check_multiple_of(values.len(), 2, "int4 value count")?;
            Ok(values
                .chunks_exact(2)
                .map(|pair| (pair[0] as u8 & 0x0F) | ((pair[1] as u8 & 0x0F) << 4))
                .collect())
        }
    }
}

/// Expands packed signed values; the inverse of [`pack_weights`].
pub fn unpack_weights(packed: &[u8], bits: WeightBits) -> Vec<i8> {
    match bits {
        WeightBits::Int8 => packed.iter().map(|&b| b as i8).collect(),
        WeightBits::Int4 => packed
            .iter()
            .flat_map(|&b| [sign_extend_nibble(b & 0x0F), sign_extend_nibble(b >> 4)])
            .collect(),
    }
}

#[inline]
fn sign_extend_nibble(nibble: u8) -> i8 {
    ((nibble << 4) as i8) >> 4
}

fn check_layout_dims(
    len: usize,
    rows: usize,
    cols: usize,
    bits: WeightBits,
    layout: WeightLayout,
) -> BackendResult<()> {
    let epb = bits.elements_per_byte();
    check_nonzero(rows, "weight rows (k)")?;
    check_nonzero(cols, "weight columns (n)")?;
    check_multiple_of(cols, 8, "weight columns (n)")?;
    check_multiple_of(rows, epb, "weight rows (k)")?;
    if layout.uses_tensor_core_tiles() {
        check_multiple_of(rows, layout.row_alignment(), "weight rows (k)")?;
    }
    if len != rows * cols / epb {
        return Err(BackendError::ShapeMismatch {
            tensor: "quantized_weight",
            expected: vec![rows * cols / epb],
            actual: vec![len],
        });
    }
    Ok(())
}

fn to_words(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

fn from_words(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

/// Source row, within one MMA tile, of output row `tile_row`.
#[inline]
fn ldmatrix_source_row(tile_row: usize, elements_per_reg: usize) -> usize {
    8 * ((tile_row % elements_per_reg) / 2) + tile_row % 2 + 2 * (tile_row / elements_per_reg)
}

#[inline]
fn rows_per_mma_tile(bits: WeightBits) -> usize {
    8 * (16 / bits.bits() as usize)
}

fn permute_rows_for_ldmatrix(src: &[u32], rows: usize, cols: usize, bits: WeightBits) -> Vec<u32> {
    let elements_per_reg = bits.elements_per_word();
    let tile_rows = rows_per_mma_tile(bits);
    let vec_cols = cols / elements_per_reg;

    let mut dst = vec![0u32; src.len()];
    for base_row in (0..rows).step_by(tile_rows) {
        for tile_row in 0..tile_rows {
            let read = (base_row + ldmatrix_source_row(tile_row, elements_per_reg)) * vec_cols;
            let write = (base_row + tile_row) * vec_cols;
            dst[write..write + vec_cols].copy_from_slice(&src[read..read + vec_cols]);
        }
    }
    dst
}

fn unpermute_rows_for_ldmatrix(src: &[u32], rows: usize, cols: usize, bits: WeightBits) -> Vec<u32> {
    let elements_per_reg = bits.elements_per_word();
    let tile_rows = rows_per_mma_tile(bits);
    let vec_cols = cols / elements_per_reg;

    let mut dst = vec![0u32; src.len()];
    for base_row in (0..rows).step_by(tile_rows) {
        for tile_row in 0..tile_rows {
            let original = (base_row + ldmatrix_source_row(tile_row, elements_per_reg)) * vec_cols;
            let permuted = (base_row + tile_row) * vec_cols;
            dst[original..original + vec_cols].copy_from_slice(&src[permuted..permuted + vec_cols]);
        }
    }
    dst
}

/// Element-exact transpose of a packed `[rows, cols]` matrix.
fn subbyte_transpose(src: &[u8], rows: usize, cols: usize, bits: WeightBits) -> Vec<u8> {
    let mut dst = vec![0u8; src.len()];
    match bits {
        WeightBits::Int8 => {
            dst.par_chunks_mut(rows).enumerate().for_each(|(col, out)| {
                for (row, slot) in out.iter_mut().enumerate() {
                    *slot = src[row * cols + col];
                }
            });
        }
        WeightBits::Int4 => {
            dst.par_chunks_mut(rows / 2).enumerate().for_each(|(col, out)| {
                for row in 0..rows {
                    let value = get_nibble(src, row * cols + col);
                    set_nibble(out, row, value);
                }
            });
        }
    }
    dst
}

#[inline]
fn get_nibble(buf: &[u8], idx: usize) -> u8 {
    (buf[idx / 2] >> (4 * (idx % 2))) & 0x0F
}

#[inline]
fn set_nibble(buf: &mut [u8], idx: usize, value: u8) {
    let shift = 4 * (idx % 2);
    let byte = &mut buf[idx / 2];
    *byte = (*byte & !(0x0F << shift)) | (value << shift);
}

/// Index pair `(read, write)` of the column interleave for one word.
#[inline]
fn interleave_offsets(
    read_col: usize,
    vec_read_row: usize,
    vec_rows: usize,
    vec_rows_per_tile: usize,
    interleave: usize,
) -> (usize, usize) {
    let base_vec_row = vec_read_row - vec_read_row % vec_rows_per_tile;
    let write_col = read_col / interleave;
    let vec_write_row = interleave * base_vec_row
        + vec_rows_per_tile * (read_col % interleave)
        + vec_read_row % vec_rows_per_tile;
    (
        read_col * vec_rows + vec_read_row,
        write_col * vec_rows * interleave + vec_write_row,
    )
}

fn interleave_column_major(
    src: &[u32],
    rows: usize,
    cols: usize,
    bits: WeightBits,
    rows_per_tile: usize,
    interleave: usize,
) -> Vec<u32> {
    let vec_rows = rows / bits.elements_per_word();
    let vec_rows_per_tile = rows_per_tile / bits.elements_per_word();

    let mut dst = vec![0u32; src.len()];
    for read_col in 0..cols {
        for vec_read_row in 0..vec_rows {
            let (read, write) =
                interleave_offsets(read_col, vec_read_row, vec_rows, vec_rows_per_tile, interleave);
            dst[write] = src[read];
        }
    }
    dst
}

fn deinterleave_column_major(
    src: &[u32],
    rows: usize,
    cols: usize,
    bits: WeightBits,
    rows_per_tile: usize,
    interleave: usize,
) -> Vec<u32> {
    let vec_rows = rows / bits.elements_per_word();
    let vec_rows_per_tile = rows_per_tile / bits.elements_per_word();

    let mut dst = vec![0u32; src.len()];
    for read_col in 0..cols {
        for vec_read_row in 0..vec_rows {
            let (original, interleaved) =
                interleave_offsets(read_col, vec_read_row, vec_rows, vec_rows_per_tile, interleave);
            dst[original] = src[interleaved];
        }
    }
    dst
}

/// Source nibble of destination nibble `dest` within one register:
/// the result reads `[e7 e5 e3 e1 e6 e4 e2 e0]` from the high nibble down.
#[inline]
fn int4_register_source(dest: usize) -> usize {
    if dest < 4 {
        2 * dest
    } else {
        2 * (dest - 4) + 1
    }
}

fn add_bias_and_interleave_registers(buf: &mut [u8], bits: WeightBits) {
    match bits {
        WeightBits::Int8 => {
            for byte in buf.iter_mut() {
                *byte = byte.wrapping_add(128);
            }
            for word in buf.chunks_exact_mut(4) {
                word.swap(1, 2);
            }
        }
        WeightBits::Int4 => {
            // +8 on a signed nibble flips its top bit.
            for byte in buf.iter_mut() {
                *byte ^= 0x88;
            }
            for word in buf.chunks_exact_mut(4) {
                let src = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
                let mut dst = 0u32;
                for dest in 0..8 {
                    let nibble = (src >> (4 * int4_register_source(dest))) & 0xF;
                    dst |= nibble << (4 * dest);
                }
                word.copy_from_slice(&dst.to_le_bytes());
            }
        }
    }
}

fn remove_bias_and_deinterleave_registers(buf: &mut [u8], bits: WeightBits) {
    match bits {
        WeightBits::Int8 => {
            for word in buf.chunks_exact_mut(4) {
                word.swap(1, 2);
            }
            for byte in buf.iter_mut() {
                *byte = byte.wrapping_sub(128);
            }
        }
        WeightBits::Int4 => {
            for word in buf.chunks_exact_mut(4) {
                let src = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
                let mut dst = 0u32;
                for dest in 0..8 {
                    let nibble = (src >> (4 * dest)) & 0xF;
                    dst |= nibble << (4 * int4_register_source(dest));
                }
                word.copy_from_slice(&dst.to_le_bytes());
            }
            for byte in buf.iter_mut() {
                *byte ^= 0x88;
            }
        }
    }
}
