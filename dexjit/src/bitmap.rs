//! Packed bitmaps: codegen for per-row bit access and the batch-level AND.
//!
//! Bits are little-endian within each byte: row `i` lives in byte `i / 8`,
//! bit `i % 8`, matching Arrow validity and boolean buffers.

use cranelift_codegen::ir::{types, InstBuilder, MemFlags, Value};
use cranelift_frontend::FunctionBuilder;

/// Emit a load of the bit at `position` (an I64) in `bitmap`. Returns an I8
/// holding 0 or 1. No bounds check.
pub fn get_packed_bit_value(
    builder: &mut FunctionBuilder,
    bitmap: Value,
    position: Value,
) -> Value {
    let ptr_type = builder.func.dfg.value_type(bitmap);
    let byte_idx = builder.ins().ushr_imm(position, 3);
    let byte_idx = cast_index(builder, byte_idx, ptr_type);
    let byte_addr = builder.ins().iadd(bitmap, byte_idx);
    let byte = builder
        .ins()
        .uload8(types::I32, MemFlags::trusted(), byte_addr, 0);

    let bit_idx = builder.ins().band_imm(position, 7);
    let bit_idx = builder.ins().ireduce(types::I32, bit_idx);
    let shifted = builder.ins().ushr(byte, bit_idx);
    let bit = builder.ins().band_imm(shifted, 1);
    builder.ins().ireduce(types::I8, bit)
}

/// Emit a read-modify-write that sets the bit at `position` to `value`
/// (an I8, 0 or 1). Not atomic; generated loops have a single writer.
pub fn set_packed_bit_value(
    builder: &mut FunctionBuilder,
    bitmap: Value,
    position: Value,
    value: Value,
) {
    let ptr_type = builder.func.dfg.value_type(bitmap);
    let byte_idx = builder.ins().ushr_imm(position, 3);
    let byte_idx = cast_index(builder, byte_idx, ptr_type);
    let byte_addr = builder.ins().iadd(bitmap, byte_idx);
    let byte = builder
        .ins()
        .uload8(types::I32, MemFlags::trusted(), byte_addr, 0);

    let bit_idx = builder.ins().band_imm(position, 7);
    let bit_idx = builder.ins().ireduce(types::I32, bit_idx);
    let one = builder.ins().iconst(types::I32, 1);
    let mask = builder.ins().ishl(one, bit_idx);
    let cleared = builder.ins().band_not(byte, mask);

    let value = builder.ins().uextend(types::I32, value);
    let value = builder.ins().band_imm(value, 1);
    let bit = builder.ins().ishl(value, bit_idx);
    let updated = builder.ins().bor(cleared, bit);
    builder
        .ins()
        .istore8(MemFlags::trusted(), updated, byte_addr, 0);
}

fn cast_index(builder: &mut FunctionBuilder, idx: Value, ptr_type: types::Type) -> Value {
    if ptr_type == types::I64 {
        idx
    } else {
        builder.ins().ireduce(ptr_type, idx)
    }
}

/// Bytes backing a bitmap of `record_count` bits.
pub fn bitmap_len(record_count: usize) -> usize {
    record_count.div_ceil(8)
}

/// Bitwise-AND of `sources` into `dst`, one machine word at a time.
///
/// Only the first `ceil(record_count / 8)` bytes are touched. Bits past
/// `record_count` in the last byte are unspecified. With no sources the
/// destination is set to all ones.
pub fn intersect_bitmaps(dst: &mut [u8], sources: &[&[u8]], record_count: usize) {
    let len = bitmap_len(record_count);
    let dst = &mut dst[..len];
    match sources.split_first() {
        None => dst.fill(0xFF),
        Some((first, rest)) => {
            dst.copy_from_slice(&first[..len]);
            and_bitmaps_in_place(dst, rest, record_count);
        }
    }
}

/// Bitwise-AND of `sources` onto the current contents of `dst`.
pub fn and_bitmaps_in_place(dst: &mut [u8], sources: &[&[u8]], record_count: usize) {
    const WORD: usize = std::mem::size_of::<u64>();
    let len = bitmap_len(record_count);
    let dst = &mut dst[..len];
    let words = len / WORD;

    for src in sources {
        let src = &src[..len];
        let (dst_words, dst_tail) = dst.split_at_mut(words * WORD);
        let (src_words, src_tail) = src.split_at(words * WORD);

        for (d, s) in dst_words
            .chunks_exact_mut(WORD)
            .zip(src_words.chunks_exact(WORD))
        {
            let merged = load_word(d) & load_word(s);
            d.copy_from_slice(&merged.to_le_bytes());
        }
        for (d, s) in dst_tail.iter_mut().zip(src_tail) {
            *d &= *s;
        }
    }
}

fn load_word(bytes: &[u8]) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(bytes);
    u64::from_le_bytes(word)
}

/// Read bit `position` of `bitmap`.
pub fn get_bit(bitmap: &[u8], position: usize) -> bool {
    bitmap[position >> 3] & (1 << (position & 7)) != 0
}

/// Set bit `position` of `bitmap` to `value`.
pub fn set_bit(bitmap: &mut [u8], position: usize, value: bool) {
    let mask = 1u8 << (position & 7);
    if value {
        bitmap[position >> 3] |= mask;
    } else {
        bitmap[position >> 3] &= !mask;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::BitAccess;

    fn masked(bitmap: &[u8], record_count: usize) -> Vec<bool> {
        (0..record_count).map(|i| get_bit(bitmap, i)).collect()
    }

    #[test]
    fn test_intersect_two_sources() {
        let a = [0b1111_0101u8, 0xFF, 0x01];
        let b = [0b0011_0111u8, 0x0F, 0xFF];
        let mut dst = [0u8; 3];
        intersect_bitmaps(&mut dst, &[a.as_slice(), b.as_slice()], 17);
        assert_eq!(&dst[..2], &[0b0011_0101, 0x0F]);
        assert!(get_bit(&dst, 16));
    }

    #[test]
    fn test_intersect_spans_whole_words() {
        let a = vec![0xAAu8; 20];
        let b = vec![0x0Fu8; 20];
        let mut dst = vec![0u8; 20];
        intersect_bitmaps(&mut dst, &[a.as_slice(), b.as_slice()], 160);
        assert!(dst.iter().all(|&x| x == 0x0A));
    }

    #[test]
    fn test_single_source_copies() {
        let a = [0b101u8];
        let mut dst = [0u8];
        intersect_bitmaps(&mut dst, &[a.as_slice()], 3);
        assert_eq!(masked(&dst, 3), vec![true, false, true]);
    }

    #[test]
    fn test_no_sources_is_all_valid() {
        let mut dst = [0u8; 2];
        intersect_bitmaps(&mut dst, &[], 9);
        assert_eq!(masked(&dst, 9), vec![true; 9]);
    }

    #[test]
    fn test_zero_records_touches_nothing() {
        let empty: &[u8] = &[];
        let mut dst: [u8; 0] = [];
        intersect_bitmaps(&mut dst, &[empty, empty], 0);
        let mut dst = [0x5Au8];
        and_bitmaps_in_place(&mut dst, &[[0x00u8].as_slice()], 0);
        assert_eq!(dst, [0x5A]);
    }

    #[test]
    fn test_set_get_helpers() {
        let mut bm = [0u8; 2];
        set_bit(&mut bm, 9, true);
        set_bit(&mut bm, 0, true);
        set_bit(&mut bm, 0, false);
        assert_eq!(bm, [0, 0b10]);
        assert!(get_bit(&bm, 9));
    }

    #[test]
    fn test_generated_bit_access_round_trip() {
        let access = BitAccess::compile().unwrap();

        let mut bm = [0b0100_0001u8, 0xFF];
        assert!(access.set(&mut bm, 6, false));
        assert_eq!(bm, [0b0000_0001, 0xFF]);
        assert!(access.set(&mut bm, 12, false));
        assert_eq!(bm, [0b0000_0001, 0xEF]);
        assert!(!access.set(&mut bm, 3, true));
        assert_eq!(bm, [0b0000_1001, 0xEF]);
    }
}
