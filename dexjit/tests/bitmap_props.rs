//! Property tests for bitmap merging and generated null propagation.

use std::sync::Arc;

use arrow::array::{Array, Int32Array, RecordBatch};
use arrow::datatypes::{DataType, Field, Schema};
use dexjit::bitmap::{get_bit, intersect_bitmaps, set_bit};
use dexjit::{GeneratorConfig, Node, Projector};
use proptest::prelude::*;

fn bitmaps(count: usize, len: usize) -> impl Strategy<Value = Vec<Vec<u8>>> {
    prop::collection::vec(prop::collection::vec(any::<u8>(), len), count)
}

fn merged(sources: &[Vec<u8>], record_count: usize) -> Vec<bool> {
    let refs: Vec<&[u8]> = sources.iter().map(Vec::as_slice).collect();
    let mut dst = vec![0u8; record_count.div_ceil(8)];
    intersect_bitmaps(&mut dst, &refs, record_count);
    (0..record_count).map(|i| get_bit(&dst, i)).collect()
}

proptest! {
    #[test]
    fn intersect_is_order_independent(
        (record_count, mut sources) in (0usize..200)
            .prop_flat_map(|n| (Just(n), bitmaps(3, n.div_ceil(8))))
    ) {
        let forward = merged(&sources, record_count);
        sources.reverse();
        prop_assert_eq!(&forward, &merged(&sources, record_count));
        sources.swap(0, 1);
        prop_assert_eq!(&forward, &merged(&sources, record_count));

        let expected: Vec<bool> = (0..record_count)
            .map(|i| sources.iter().all(|s| get_bit(s, i)))
            .collect();
        prop_assert_eq!(forward, expected);
    }

    #[test]
    fn intersect_single_source_copies(
        (record_count, sources) in (1usize..200)
            .prop_flat_map(|n| (Just(n), bitmaps(1, n.div_ceil(8))))
    ) {
        let expected: Vec<bool> = (0..record_count).map(|i| get_bit(&sources[0], i)).collect();
        prop_assert_eq!(merged(&sources, record_count), expected);
    }

    #[test]
    fn set_bit_touches_only_its_bit(
        mut bitmap in prop::collection::vec(any::<u8>(), 1..16),
        pos in any::<prop::sample::Index>(),
        value in any::<bool>(),
    ) {
        let before = bitmap.clone();
        let pos = pos.index(bitmap.len() * 8);
        set_bit(&mut bitmap, pos, value);
        prop_assert_eq!(get_bit(&bitmap, pos), value);
        for j in (0..before.len() * 8).filter(|&j| j != pos) {
            prop_assert_eq!(get_bit(&bitmap, j), get_bit(&before, j));
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn subtract_matches_scalar_reference(
        rows in prop::collection::vec((any::<Option<i32>>(), any::<Option<i32>>()), 0..100)
    ) {
        let schema = Arc::new(Schema::new(vec![
            Field::new("a", DataType::Int32, true),
            Field::new("b", DataType::Int32, true),
        ]));
        let projector = Projector::make(
            schema.clone(),
            vec![(
                Node::call("subtract", vec![Node::field("a"), Node::field("b")]),
                Field::new("diff", DataType::Int32, true),
            )],
            GeneratorConfig::default(),
        )
        .unwrap();

        let (a, b): (Vec<_>, Vec<_>) = rows.iter().copied().unzip();
        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(Int32Array::from(a)), Arc::new(Int32Array::from(b))],
        )
        .unwrap();
        let out = projector.evaluate(&batch).unwrap();
        let diff = out.column(0).as_any().downcast_ref::<Int32Array>().unwrap();

        for (i, (a, b)) in rows.iter().enumerate() {
            match (a, b) {
                (Some(a), Some(b)) => {
                    prop_assert!(diff.is_valid(i));
                    prop_assert_eq!(diff.value(i), a.wrapping_sub(*b));
                }
                _ => prop_assert!(diff.is_null(i)),
            }
        }
    }
}
