//! Memory-dependency analysis, usage estimation, stage dumps and the
//! reporting queries.

mod common;

use kiln::options::BuildOptions;
use kiln::primitive::ActivationFunc;
use kiln::tensor::{DType, TensorDims};
use kiln::{Program, Topology};

fn act_chain() -> Topology {
    let mut topology = Topology::new();
    topology
        .add(common::input("I", 1, 8, 16, 16, DType::F32))
        .expect("add input");
    topology
        .add(common::activation("A", "I", ActivationFunc::Relu))
        .expect("add A");
    topology
        .add(common::activation("B", "A", ActivationFunc::Sigmoid))
        .expect("add B");
    topology
        .add(common::activation("C", "B", ActivationFunc::Tanh))
        .expect("add C");
    topology
}

#[test]
fn adjacent_live_ranges_restrict_buffer_sharing() {
    let program = Program::build(
        common::engine(),
        &act_chain(),
        Default::default(),
        false,
        false,
        false,
    )
    .expect("build");

    // B is live while A is still being read, so the two may not alias
    let b = program.get_node("B").expect("B");
    assert!(b.memory_dependencies().contains("A"));
    let rendered = program.get_memory_dependencies_string();
    assert!(rendered.contains("primitive: B"));
    assert!(rendered.contains("A"));
}

#[test]
fn estimator_accounts_constants_and_activations() {
    let mut topology = act_chain();
    topology
        .add(common::data_f32_fill("W", TensorDims::bfyx(8, 8, 1, 1), 1.0))
        .expect("add data");
    topology
        .add(common::eltwise("E", "C", "W", kiln::primitive::EltwiseOp::Mul))
        .expect("add eltwise");

    let program = Program::build(
        common::engine(),
        &topology,
        Default::default(),
        false,
        false,
        false,
    )
    .expect("build");

    let (const_bytes, device_bytes) = program.get_estimated_device_mem_usage();
    assert_eq!(const_bytes, 8 * 8 * 4, "one data node worth of constants");
    assert!(device_bytes > 0, "activations occupy pool memory");
}

#[test]
fn estimator_aborts_on_tiny_global_memory() {
    use kiln::engine::{DeviceInfo, DeviceType};
    let engine = kiln_ref_engine::RefEngine::new()
        .with_device_info(DeviceInfo {
            max_alloc_mem_size: 1 << 20,
            max_global_mem_size: 16,
            device_type: DeviceType::DiscreteGpu,
            supports_usm_device: true,
            supports_immad: false,
        })
        .into_arc();
    let program = Program::build(
        engine,
        &act_chain(),
        Default::default(),
        false,
        false,
        false,
    )
    .expect("build");

    assert_eq!(
        program.get_estimated_device_mem_usage(),
        kiln::memory::ESTIMATE_ABORTED
    );
}

#[test]
fn stage_dumps_land_in_the_configured_directory() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let options = BuildOptions {
        graph_dumps_dir: Some(dir.path().to_path_buf()),
        ..Default::default()
    };
    let program = Program::build(common::engine(), &act_chain(), options, false, false, false)?;

    let mut extensions: Vec<String> = Vec::new();
    for entry in std::fs::read_dir(dir.path())? {
        let name = entry?.file_name().into_string().unwrap_or_default();
        assert!(name.starts_with(&format!("kiln_program_{}_", program.id())));
        if let Some(ext) = name.rsplit('.').next() {
            extensions.push(ext.to_string());
        }
    }
    extensions.sort();
    extensions.dedup();
    assert_eq!(extensions, ["graph", "info", "optimized", "order"]);

    // dumping also records the per-pass snapshots
    assert!(!program.optimizer_passes_info().is_empty());
    let (first_pass, _) = &program.optimizer_passes_info()[0];
    assert_eq!(first_pass, "graph_initializations");
    Ok(())
}

#[test]
fn primitives_info_reports_execution_order_and_precision() {
    let program = Program::build(
        common::engine(),
        &act_chain(),
        Default::default(),
        false,
        false,
        false,
    )
    .expect("build");

    let info = program.primitives_info();
    assert_eq!(info.len(), 4);
    for (idx, record) in info.iter().enumerate() {
        assert_eq!(record.exec_id, idx);
        assert_eq!(record.precision, "f32");
        assert!(record.impl_name.contains("_ref_"));
    }
    assert_eq!(info[0].id, "I");
}

#[test]
fn tuning_mode_requires_profiling_engine() {
    let options = BuildOptions {
        tuning_config: kiln::options::TuningConfig {
            mode: kiln::options::TuningMode::TuneAndCache,
        },
        ..Default::default()
    };
    let err = Program::build(
        common::engine(),
        &act_chain(),
        options.clone(),
        false,
        false,
        false,
    )
    .expect_err("must fail without profiling");
    assert!(matches!(err, kiln::GraphError::Configuration(_)));

    let profiled = kiln_ref_engine::RefEngine::new().with_profiling().into_arc();
    Program::build(profiled, &act_chain(), options, false, false, false)
        .expect("profiling engine accepts tuning");
}
