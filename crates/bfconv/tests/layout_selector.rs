mod common;

use bfconv::{
    select_formats, AlgKind, ConvDesc, ConvolutionBwdDataPd, ConvolutionFwdPd, DataType,
    Direction, FormatTag, FwdHint, MemoryDesc, PrimitiveAttr, PropKind, SpatialRank,
};
use common::{engine, MockBwdData, MockFwd};

#[test]
fn forward_table() {
    let table = [
        (SpatialRank::D1, false, FormatTag::NCw16c, FormatTag::OIw8i16o2i),
        (SpatialRank::D1, true, FormatTag::NCw16c, FormatTag::gOIw8i16o2i),
        (SpatialRank::D2, false, FormatTag::NChw16c, FormatTag::OIhw8i16o2i),
        (SpatialRank::D2, true, FormatTag::NChw16c, FormatTag::gOIhw8i16o2i),
        (SpatialRank::D3, false, FormatTag::NCdhw16c, FormatTag::OIdhw8i16o2i),
        (SpatialRank::D3, true, FormatTag::NCdhw16c, FormatTag::gOIdhw8i16o2i),
    ];
    for (rank, groups, data, weights) in table {
        let formats = select_formats(rank, groups, Direction::Forward);
        assert_eq!(formats.data, data, "{rank:?} groups={groups}");
        assert_eq!(formats.weights, weights, "{rank:?} groups={groups}");
        assert_eq!(formats, select_formats(rank, groups, Direction::Forward));
    }
}

#[test]
fn backward_data_table() {
    let table = [
        (SpatialRank::D1, false, FormatTag::NCw16c, FormatTag::OIw8o16i2o),
        (SpatialRank::D1, true, FormatTag::NCw16c, FormatTag::gOIw8o16i2o),
        (SpatialRank::D2, false, FormatTag::NChw16c, FormatTag::OIhw8o16i2o),
        (SpatialRank::D2, true, FormatTag::NChw16c, FormatTag::gOIhw8o16i2o),
        (SpatialRank::D3, false, FormatTag::NCdhw16c, FormatTag::OIdhw8o16i2o),
        (SpatialRank::D3, true, FormatTag::NCdhw16c, FormatTag::gOIdhw8o16i2o),
    ];
    for (rank, groups, data, weights) in table {
        let formats = select_formats(rank, groups, Direction::BackwardData);
        assert_eq!(formats.data, data, "{rank:?} groups={groups}");
        assert_eq!(formats.weights, weights, "{rank:?} groups={groups}");
    }
}

#[test]
fn any_tags_resolve_per_rank_and_grouping() {
    let engine = engine(1);
    let attr = PrimitiveAttr::default();
    let cases: [(&[usize], &[usize], &[usize]); 4] = [
        (&[1, 32, 6], &[2, 16, 16, 3], &[1, 32, 4]),
        (&[1, 16, 6, 6], &[16, 16, 3, 3], &[1, 16, 4, 4]),
        (&[1, 32, 5, 6, 6], &[2, 16, 16, 1, 3, 3], &[1, 32, 5, 4, 4]),
        (&[1, 16, 5, 6, 6], &[16, 16, 1, 3, 3], &[1, 16, 5, 4, 4]),
    ];
    for (src, wei, dst) in cases {
        let desc = ConvDesc::builder(PropKind::ForwardTraining, AlgKind::Direct)
            .src(MemoryDesc::new(DataType::Bf16, src))
            .weights(MemoryDesc::new(DataType::Bf16, wei))
            .dst(MemoryDesc::new(DataType::F32, dst))
            .build()
            .unwrap();
        let expected = select_formats(desc.spatial_rank(), desc.with_groups(), Direction::Forward);
        let pd = ConvolutionFwdPd::<MockFwd>::new(&engine, &desc, &attr).unwrap();
        let layouts = pd.base().layouts();
        assert_eq!(layouts.src, expected.data);
        assert_eq!(layouts.dst, expected.data);
        assert_eq!(layouts.weights, expected.weights);
        assert_eq!(layouts.bias, None);
        assert_eq!(pd.hint().data, expected.data);
        assert_eq!(pd.hint().with_groups, desc.with_groups());
    }
}

#[test]
fn backward_data_reuses_forward_data_layout() {
    let engine = engine(1);
    let attr = PrimitiveAttr::default();
    let desc = ConvDesc::builder(PropKind::BackwardData, AlgKind::Direct)
        .diff_src(MemoryDesc::new(DataType::F32, &[1, 16, 6, 6]))
        .weights(MemoryDesc::new(DataType::Bf16, &[16, 16, 3, 3]))
        .diff_dst(MemoryDesc::new(DataType::Bf16, &[1, 16, 4, 4]))
        .build()
        .unwrap();

    let hint = FwdHint {
        rank: SpatialRank::D2,
        with_groups: false,
        data: FormatTag::NChw16c,
    };
    let pd = ConvolutionBwdDataPd::<MockBwdData>::new(&engine, &desc, &attr, Some(&hint)).unwrap();
    assert_eq!(pd.base().layouts().src, FormatTag::NChw16c);
    assert_eq!(pd.base().layouts().weights, FormatTag::OIhw8o16i2o);

    // A hint for another rank is ignored.
    let other = FwdHint {
        rank: SpatialRank::D1,
        data: FormatTag::NCw16c,
        ..hint
    };
    let pd = ConvolutionBwdDataPd::<MockBwdData>::new(&engine, &desc, &attr, Some(&other)).unwrap();
    assert_eq!(pd.base().layouts().dst, FormatTag::NChw16c);

    // So is one from a grouped forward problem.
    let grouped = FwdHint {
        with_groups: true,
        data: FormatTag::NCdhw16c,
        ..hint
    };
    let pd =
        ConvolutionBwdDataPd::<MockBwdData>::new(&engine, &desc, &attr, Some(&grouped)).unwrap();
    assert_eq!(pd.base().layouts().src, FormatTag::NChw16c);
}
