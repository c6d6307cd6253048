//! Property-based tests for the min/max quantization codec
//!
//! These tests use proptest to verify reconstruction bounds and code ranges.

use proptest::prelude::*;
use tessera::quantize::{LowBitConfig, QuantType};
use tessera::{DataType, Tensor};

/// Strategy for a `[rows, cols]` matrix with its row-major values
fn matrix_strategy() -> impl Strategy<Value = (usize, usize, Vec<f32>)> {
    (1usize..8, 1usize..16).prop_flat_map(|(rows, cols)| {
        prop::collection::vec(-20.0f32..20.0f32, rows * cols)
            .prop_map(move |data| (rows, cols, data))
    })
}

fn quant_type_strategy() -> impl Strategy<Value = QuantType> {
    prop::sample::select(vec![QuantType::Asymmetric, QuantType::Symmetric])
}

fn tolerance(cfg: &LowBitConfig) -> f32 {
    cfg.scale * 0.5 + (cfg.max - cfg.min) * 1e-5 + 1e-6
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Any value inside the calibrated range reconstructs within half a step
    #[test]
    fn test_dequantize_within_half_step(
        min in -100.0f32..0.0,
        max in 0.0f32..100.0,
        bit in 1u8..=16,
        qtype in quant_type_strategy(),
        t in 0.0f32..=1.0,
    ) {
        let cfg = LowBitConfig::new(min, max, bit, qtype).unwrap();
        let x = min + (max - min) * t;
        let q = cfg.quantize(x);
        prop_assert!(q <= cfg.qmax());
        let err = (cfg.dequantize(q) - x).abs();
        prop_assert!(err <= tolerance(&cfg), "x={} err={} scale={}", x, err, cfg.scale);
    }

    /// Codes never leave `[0, 2^bit - 1]`, even far outside the range
    #[test]
    fn test_codes_clamped(
        min in -10.0f32..0.0,
        max in 0.0f32..10.0,
        bit in 1u8..=8,
        qtype in quant_type_strategy(),
        x in -1e6f32..1e6f32,
    ) {
        let cfg = LowBitConfig::new(min, max, bit, qtype).unwrap();
        prop_assert!(cfg.quantize(x) <= cfg.qmax());
    }

    /// Calibrated ranges always straddle zero
    #[test]
    fn test_range_contains_zero(
        a in -50.0f32..50.0,
        b in -50.0f32..50.0,
        bit in 1u8..=16,
    ) {
        let cfg = LowBitConfig::new(a.min(b), a.max(b), bit, QuantType::Asymmetric).unwrap();
        prop_assert!(cfg.min <= 0.0);
        prop_assert!(cfg.max >= 0.0);
        prop_assert!(cfg.zero_point <= cfg.qmax());
    }

    /// Rebuilding from the stored range reproduces the same parameters
    #[test]
    fn test_stored_range_is_stable(
        min in -30.0f32..0.0,
        max in 0.0f32..30.0,
        bit in prop::sample::select(vec![1u8, 2, 4, 8, 16]),
        qtype in quant_type_strategy(),
    ) {
        let cfg = LowBitConfig::new(min, max, bit, qtype).unwrap();
        let (lo, hi) = cfg.stored_range();
        let again = LowBitConfig::new(lo, hi, bit, qtype).unwrap();
        prop_assert_eq!(again.zero_point, cfg.zero_point);
        prop_assert!((again.scale - cfg.scale).abs() <= cfg.scale * 1e-4);
    }

    /// Per-row Int8 weights reconstruct every element within its row's step
    #[test]
    fn test_per_channel_tensor_roundtrip((rows, cols, data) in matrix_strategy()) {
        let t = Tensor::quantize_from_f32(DataType::Int8, &[rows, cols], &data, Some(0)).unwrap();
        prop_assert_eq!(t.quant_configs().len(), rows);
        prop_assert_eq!(t.get_bytes(), rows * cols);

        let restored = t.to_f32_vec().unwrap();
        for (i, (x, y)) in data.iter().zip(&restored).enumerate() {
            let cfg = &t.quant_configs()[i / cols];
            prop_assert!((x - y).abs() <= tolerance(cfg), "element {}: {} vs {}", i, x, y);
        }
    }

    /// Globally quantized 4-bit tensors pack two codes per byte
    #[test]
    fn test_global_int4_tensor((rows, cols, data) in matrix_strategy()) {
        let t = Tensor::quantize_from_f32(DataType::Int4, &[rows, cols], &data, None).unwrap();
        prop_assert_eq!(t.quant_configs().len(), 1);
        prop_assert_eq!(t.get_bytes(), (rows * cols).div_ceil(2));

        let cfg = t.quant_configs()[0];
        for (x, y) in data.iter().zip(t.to_f32_vec().unwrap()) {
            prop_assert!((x - y).abs() <= tolerance(&cfg));
        }
    }
}
