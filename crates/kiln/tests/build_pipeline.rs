//! End-to-end pipeline scenarios: conv layout inference, activation fusion,
//! constant propagation, split expansion and redundant-reorder removal.

mod common;

use kiln::options::BuildOptions;
use kiln::pass::{Pass, RemoveRedundantReorders};
use kiln::primitive::{ActivationFunc, EltwiseOp, PrimitiveDescriptor, PrimitiveKind};
use kiln::tensor::{DType, Format, TensorDims};
use kiln::{Program, Topology};

fn optimized() -> BuildOptions {
    BuildOptions {
        optimize_data: true,
        ..Default::default()
    }
}

#[test]
fn single_conv_gets_inferred_layout_and_impl() {
    let mut topology = Topology::new();
    topology
        .add(common::input("I", 1, 3, 224, 224, DType::F16))
        .expect("add input");
    topology
        .add(common::data_f32_fill(
            "W",
            TensorDims::bfyx(64, 3, 3, 3),
            0.5,
        ))
        .expect("add weights");
    topology.add(common::conv("C", "I", "W", 2, 1)).expect("add conv");

    let program = Program::build(common::engine(), &topology, optimized(), false, false, false)
        .expect("build");

    let c = program.get_node("C").expect("conv node");
    let layout = c.output_layout().expect("valid layout");
    assert_eq!(layout.size, TensorDims::bfyx(1, 64, 112, 112));

    // a single-conv topology stays plain; the only node allowed between I
    // and C is the padding reorder materialized for pad=1
    assert_eq!(layout.format, Format::Bfyx);
    let c_input = c.dependencies()[0];
    let i_id = program.get_node_id("I").expect("input id");
    let direct_or_padded = c_input == i_id || {
        let between = program.get_node_id("reorder_input_C").expect("pad reorder");
        between == c_input
    };
    assert!(direct_or_padded);

    let selected = c.selected_impl().expect("impl selected");
    assert!(selected.kernel_name.contains("convolution"));
    assert!(!program.get_implementation_info("C").starts_with("undef"));
}

#[test]
fn conv_relu_fuses_into_the_conv() {
    let mut topology = Topology::new();
    topology
        .add(common::input("I", 1, 3, 32, 32, DType::F16))
        .expect("add input");
    topology
        .add(common::data_f32_fill("W", TensorDims::bfyx(8, 3, 3, 3), 1.0))
        .expect("add weights");
    topology.add(common::conv("C", "I", "W", 1, 1)).expect("add conv");
    topology
        .add(common::activation("R", "C", ActivationFunc::Relu))
        .expect("add relu");

    let program = Program::build(common::engine(), &topology, optimized(), false, false, false)
        .expect("build");

    assert!(!program.contains_id("R"), "peer is gone from the id map");
    let c = program.get_node("C").expect("conv");
    assert_eq!(c.fused_primitives().len(), 1);
    let fused = &c.fused_primitives()[0];
    assert!(matches!(
        &fused.desc.kind,
        PrimitiveKind::Activation {
            func: ActivationFunc::Relu,
            ..
        }
    ));
    assert!(c.is_output(), "outputness moved to the host");

    let entry = program
        .optimized_out()
        .iter()
        .find(|(id, _)| id == "R")
        .expect("fusion recorded");
    assert_eq!(entry.1, vec!["C".to_string()]);
}

#[test]
fn constant_subgraph_folds_into_data() {
    let dims = TensorDims::bfyx(8, 3, 3, 3);
    let mut topology = Topology::new();
    topology
        .add(common::input("I", 1, 3, 16, 16, DType::F32))
        .expect("add input");
    topology
        .add(common::data_f32_fill("W", dims, 2.0))
        .expect("add W");
    topology
        .add(common::data_f32_fill("B", dims, 0.25))
        .expect("add B");
    topology
        .add(common::eltwise("A", "W", "B", EltwiseOp::Add))
        .expect("add A");
    topology.add(common::conv("C", "I", "A", 1, 1)).expect("add conv");

    let program = Program::build(common::engine(), &topology, optimized(), false, false, false)
        .expect("build");

    let a = program.get_node("A").expect("A survives under its id");
    let values = common::payload_as_f32(a.desc());
    assert_eq!(values.len() as i64, dims.count());
    assert!(values.iter().all(|&v| (v - 2.25).abs() < 1e-6));

    assert!(!program.contains_id("W"), "constant producer demoted");
    assert!(!program.contains_id("B"), "constant producer demoted");
}

#[test]
fn split_expands_into_named_crops() {
    let mut topology = Topology::new();
    topology
        .add(common::input("I", 1, 16, 4, 4, DType::F32))
        .expect("add input");
    topology
        .add(PrimitiveDescriptor::new(
            "S",
            vec!["I".into()],
            PrimitiveKind::Split {
                output_ids: vec!["out0".into(), "out1".into()],
                output_offsets: vec![
                    TensorDims::new(0, 0, [0, 0, 0]),
                    TensorDims::new(0, 8, [0, 0, 0]),
                ],
            },
        ))
        .expect("add split");

    let program = Program::build(common::engine(), &topology, Default::default(), false, true, false)
        .expect("init build");

    assert!(!program.contains_id("S"), "split itself is optimized out");
    for (name, offset) in [("S:out0", 0), ("S:out1", 8)] {
        let crop = program.get_node(name).expect("crop exists");
        match &crop.desc().kind {
            PrimitiveKind::Crop { reference, offsets } => {
                assert_eq!(offsets.feature, offset);
                assert_eq!(reference.feature, 8);
                assert_eq!(reference.spatial, [4, 4, 1]);
            }
            other => panic!("expected crop, got {:?}", other.tag()),
        }
    }
    let entry = program
        .optimized_out()
        .iter()
        .find(|(id, _)| id == "S")
        .expect("split logged");
    assert_eq!(entry.1, vec!["S:out0".to_string(), "S:out1".to_string()]);
}

#[test]
fn redundant_reorder_is_removed_and_removal_is_idempotent() {
    let layout = kiln::tensor::Layout::new(DType::F32, Format::Bfyx, TensorDims::bfyx(1, 4, 8, 8));
    let mut topology = Topology::new();
    topology
        .add(common::input("I", 1, 4, 8, 8, DType::F32))
        .expect("add input");
    topology
        .add(common::reorder_same("R", "I", layout))
        .expect("add reorder");
    topology
        .add(common::activation("A", "R", ActivationFunc::Relu))
        .expect("add act");

    let mut program = Program::build(
        common::engine(),
        &topology,
        Default::default(),
        false,
        true,
        false,
    )
    .expect("init build");

    let mut pass = RemoveRedundantReorders {
        enable_reorder_fusing: false,
        post_compile: false,
        remove_output_reorders: false,
    };
    pass.run(&mut program).expect("first run");
    assert!(!program.contains_id("R"));
    assert!(program
        .optimized_out()
        .iter()
        .any(|(id, _)| id == "R"));
    let i = program.get_node_id("I").expect("I");
    assert_eq!(program.get_node("A").expect("A").dependencies(), &[i]);

    let before = program.optimized_out().len();
    pass.run(&mut program).expect("second run");
    assert_eq!(program.optimized_out().len(), before, "idempotent");
    program.check_edge_symmetry().expect("symmetric");
}

#[test]
fn mark_nodes_is_idempotent() {
    let mut topology = Topology::new();
    topology
        .add(common::input("I", 1, 4, 8, 8, DType::F32))
        .expect("add input");
    topology
        .add(common::data_f32_fill("W", TensorDims::bfyx(4, 4, 1, 1), 1.0))
        .expect("add data");
    topology
        .add(common::eltwise("E", "I", "W", EltwiseOp::Mul))
        .expect("add eltwise");

    let mut program = Program::build(
        common::engine(),
        &topology,
        Default::default(),
        false,
        true,
        false,
    )
    .expect("init build");

    let snapshot = |p: &Program| {
        ["I", "W", "E"]
            .map(|id| {
                let n = p.get_node(id).expect("node");
                (n.is_constant(), n.is_in_data_flow())
            })
    };
    let first = snapshot(&program);
    let mut pass = kiln::pass::MarkNodes;
    pass.run(&mut program).expect("mark again");
    assert_eq!(snapshot(&program), first);
    // data is constant, input flows data, eltwise joins both
    assert_eq!(first, [(false, true), (true, false), (false, true)]);
}
