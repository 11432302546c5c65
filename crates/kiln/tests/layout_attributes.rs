//! Layout-optimizer attribute thresholds: the network-wide format flips
//! are part of the compiler contract.

mod common;

use kiln::layout_optimizer::{set_layout_optimizer_attributes, LayoutOptimizer};
use kiln::primitive::{PrimitiveDescriptor, PrimitiveKind, QuantizeParams};
use kiln::tensor::{DType, TensorDims};
use kiln::{Program, Topology};

/// A chain of `n` fsv16-friendly convolutions (ofm 16, 3x3, pad 1).
fn conv_chain(n: usize) -> Topology {
    let mut topology = Topology::new();
    topology
        .add(common::input("I", 1, 16, 32, 32, DType::F16))
        .expect("add input");
    let mut prev = "I".to_string();
    for i in 0..n {
        let w = format!("W{i}");
        let c = format!("C{i}");
        topology
            .add(common::data_f32_fill(&w, TensorDims::bfyx(16, 16, 3, 3), 0.1))
            .expect("add weights");
        topology.add(common::conv(&c, &prev, &w, 1, 1)).expect("add conv");
        prev = c;
    }
    topology
}

fn attributes_for(topology: &Topology) -> LayoutOptimizer {
    let mut program = Program::build(
        common::engine(),
        topology,
        Default::default(),
        false,
        true,
        false,
    )
    .expect("init build");
    let mut lo = LayoutOptimizer::new(false);
    set_layout_optimizer_attributes(&mut program, &mut lo).expect("attributes");
    lo
}

#[test]
fn fsv16_needs_more_than_eleven_convolutions() {
    let lo = attributes_for(&conv_chain(11));
    assert!(!lo.attributes().b_fs_yx_fsv16_network);

    let lo = attributes_for(&conv_chain(12));
    assert!(lo.attributes().b_fs_yx_fsv16_network);
    assert_eq!(lo.total_conv_count(), 12);
}

#[test]
fn int8_quantized_model_flips_fsv16_regardless_of_size() {
    let mut topology = conv_chain(2);
    // a quantize producing i8 marks the whole model as int8-quantized
    topology
        .add(common::data_f32("qlo", TensorDims::bfyx(1, 1, 1, 1), &[0.0]))
        .expect("add");
    topology
        .add(common::data_f32("qhi", TensorDims::bfyx(1, 1, 1, 1), &[6.0]))
        .expect("add");
    topology
        .add(common::data_f32("olo", TensorDims::bfyx(1, 1, 1, 1), &[-128.0]))
        .expect("add");
    topology
        .add(common::data_f32("ohi", TensorDims::bfyx(1, 1, 1, 1), &[127.0]))
        .expect("add");
    topology
        .add(PrimitiveDescriptor::new(
            "Q",
            vec!["C1".into(), "qlo".into(), "qhi".into(), "olo".into(), "ohi".into()],
            PrimitiveKind::Quantize(QuantizeParams {
                levels: 256,
                out_data_type: Some(DType::I8),
            }),
        ))
        .expect("add quantize");

    let lo = attributes_for(&topology);
    assert!(lo.attributes().b_fs_yx_fsv16_network);
}

#[test]
fn crop_heavy_graphs_stay_plain() {
    let mut topology = conv_chain(12);
    // 24 crops: num_fsv16 * 2 must exceed the crop count, 12 * 2 = 24 fails
    for i in 0..24 {
        topology
            .add(PrimitiveDescriptor::new(
                format!("crop{i}"),
                vec!["C11".into()],
                PrimitiveKind::Crop {
                    reference: TensorDims::bfyx(1, 8, 32, 32),
                    offsets: TensorDims::zero(),
                },
            ))
            .expect("add crop");
    }
    let lo = attributes_for(&topology);
    assert!(!lo.attributes().b_fs_yx_fsv16_network);
}

#[test]
fn fs_b_yx_fsv32_excludes_grouped_convolutions() {
    let plain = attributes_for(&conv_chain(12));
    assert!(plain.attributes().fs_b_yx_fsv32_network);

    let mut grouped = conv_chain(12);
    grouped
        .add(common::data_f32_fill("WG", TensorDims::bfyx(16, 4, 3, 3), 0.1))
        .expect("add weights");
    let mut desc = common::conv("CG", "C11", "WG", 1, 1);
    if let PrimitiveKind::Convolution(p) = &mut desc.kind {
        p.groups = 4;
    }
    grouped.add(desc).expect("add grouped conv");
    let lo = attributes_for(&grouped);
    assert!(!lo.attributes().fs_b_yx_fsv32_network);
}

#[test]
fn preferred_format_follows_network_attributes() {
    let topology = conv_chain(12);
    let mut program = Program::build(
        common::engine(),
        &topology,
        Default::default(),
        false,
        true,
        false,
    )
    .expect("init build");
    let mut lo = LayoutOptimizer::new(false);
    set_layout_optimizer_attributes(&mut program, &mut lo).expect("attributes");

    // the formats map was filled before the fsv16 flag flipped on, so a
    // fresh query reflects the final attribute state
    let node = program.get_node_id("C5").expect("conv id");
    let preferred = lo.preferred_format(&mut program, node).expect("query");
    assert_eq!(preferred, kiln::tensor::Format::BFsYxFsv16);
}
