//! Structural-edit contracts: edge symmetry, id management, the
//! insert/extract laws and the dangling-removal rules.

mod common;

use kiln::primitive::{ActivationFunc, PrimitiveKind};
use kiln::tensor::DType;
use kiln::{Program, Topology};

fn chain_program() -> Program {
    // I -> A -> B, both activations
    let mut topology = Topology::new();
    topology
        .add(common::input("I", 1, 4, 8, 8, DType::F32))
        .expect("add input");
    topology
        .add(common::activation("A", "I", ActivationFunc::Relu))
        .expect("add A");
    topology
        .add(common::activation("B", "A", ActivationFunc::Tanh))
        .expect("add B");
    Program::build(
        common::engine(),
        &topology,
        Default::default(),
        false,
        true,
        false,
    )
    .expect("build chain")
}

#[test]
fn edges_stay_symmetric_through_construction() {
    let program = chain_program();
    program.check_edge_symmetry().expect("symmetric edges");

    let a = program.get_node("A").expect("node A");
    assert_eq!(a.dependencies().len(), 1);
    assert_eq!(a.users().len(), 1);
}

#[test]
fn get_or_create_is_idempotent_by_id() {
    let mut program = chain_program();
    let desc = program.get_node("A").expect("node A").desc().clone();
    let first = program.get_node_id("A").expect("id");
    let again = program.get_or_create(desc);
    assert_eq!(first, again);
    assert_eq!(program.node_count(), 3);
}

#[test]
fn rename_last_writer_wins() {
    let mut program = chain_program();
    let a = program.get_node_id("A").expect("id");
    program.rename(a, "x").expect("rename to x");
    program.rename(a, "y").expect("rename to y");
    assert!(!program.contains_id("A"));
    assert!(!program.contains_id("x"));
    assert_eq!(program.get_node_id("y").expect("renamed"), a);
}

#[test]
fn rename_rejects_collisions_and_outputs() {
    let mut program = chain_program();
    let a = program.get_node_id("A").expect("id");
    assert!(program.rename(a, "I").is_err());
    // B is the endpoint, marked as output during initialization
    let b = program.get_node_id("B").expect("id");
    assert!(program.rename(b, "fresh").is_err());
}

#[test]
fn swap_names_twice_is_identity() {
    let mut program = chain_program();
    let i = program.get_node_id("I").expect("id");
    let a = program.get_node_id("A").expect("id");
    program.swap_names(i, a);
    assert_eq!(program.get_node_id("I").expect("swapped"), a);
    program.swap_names(i, a);
    assert_eq!(program.get_node_id("I").expect("restored"), i);
    assert_eq!(program.get_node_id("A").expect("restored"), a);
    program.check_edge_symmetry().expect("edges untouched");
}

#[test]
fn add_intermediate_then_extract_restores_edges() {
    let mut program = chain_program();
    let a = program.get_node_id("A").expect("id");
    let b = program.get_node_id("B").expect("id");

    let m = program.get_or_create(common::activation("M", "A", ActivationFunc::Sigmoid));
    program
        .add_intermediate(m, b, 0, true, false)
        .expect("insert intermediate");
    assert_eq!(program.get_node("B").expect("B").dependencies(), &[m]);
    program.check_edge_symmetry().expect("symmetric after insert");

    assert!(program.extract(m).expect("extract"));
    assert_eq!(program.get_node("B").expect("B").dependencies(), &[a]);
    assert!(program.get_node("M").expect("M").is_endpoint());
    program.check_edge_symmetry().expect("symmetric after extract");
}

#[test]
fn replace_requires_detached_replacement() {
    let mut program = chain_program();
    let i = program.get_node_id("I").expect("id");
    let a = program.get_node_id("A").expect("id");
    let b = program.get_node_id("B").expect("id");

    // replacement with users
    let err = program.replace(b, i).expect_err("must reject node with users");
    assert!(matches!(err, kiln::GraphError::InvariantViolation(_)));
    // replacement with dependencies
    let err = program.replace(a, b).expect_err("must reject node with deps");
    assert!(matches!(err, kiln::GraphError::InvariantViolation(_)));

    // graph unchanged either way
    assert!(program.contains_id("A"));
    assert_eq!(program.get_node("A").expect("A").dependencies(), &[i]);
    assert_eq!(program.get_node("B").expect("B").dependencies(), &[a]);
    program.check_edge_symmetry().expect("graph unchanged");
}

#[test]
fn replace_hands_over_edges_id_and_outputness() {
    let mut program = chain_program();
    let b = program.get_node_id("B").expect("id");
    let n = program.get_or_create(common::activation("N", "A", ActivationFunc::Elu));
    // get_or_create wires nothing; N is detached

    program.replace(b, n).expect("replace");
    assert!(!program.contains_id("N"));
    let b_node = program.get_node("B").expect("B is now the new node");
    assert!(b_node.is_output());
    assert!(matches!(
        &b_node.desc().kind,
        PrimitiveKind::Activation {
            func: ActivationFunc::Elu,
            ..
        }
    ));
    program.check_edge_symmetry().expect("symmetric after replace");
}

#[test]
fn remove_if_dangling_rules() {
    let mut program = chain_program();
    let a = program.get_node_id("A").expect("id");
    // connected: refused
    assert!(!program.remove_if_dangling(a).expect("call succeeds"));

    program.remove_all_connections(a);
    assert!(program.remove_if_dangling(a).expect("now dangling"));
    assert!(!program.contains_id("A"));
    let logged = program
        .optimized_out()
        .iter()
        .filter(|(id, _)| id == "A")
        .count();
    assert_eq!(logged, 1, "id appears exactly once in the optimized-out log");

    // outputs are kept outside debug builds
    let b = program.get_node_id("B").expect("id");
    program.remove_all_connections(b);
    assert!(!program.remove_if_dangling(b).expect("call succeeds"));
    assert!(program.contains_id("B"));
}

#[test]
fn reverse_connection_flips_one_edge() {
    let mut program = chain_program();
    let a = program.get_node_id("A").expect("id");
    let b = program.get_node_id("B").expect("id");
    program.reverse_connection(a, b).expect("reverse");
    assert_eq!(program.get_node("A").expect("A").dependencies().last(), Some(&b));
    assert!(program.get_node("B").expect("B").users().contains(&a));
    // the edge no longer exists in the original direction
    assert!(program.reverse_connection(a, b).is_err());
}

#[test]
fn move_node_relocates_between_new_neighbors() {
    let mut program = chain_program();
    let i = program.get_node_id("I").expect("id");
    let a = program.get_node_id("A").expect("id");
    let b = program.get_node_id("B").expect("id");

    // A moves onto the (I -> B)-to-be edge after extraction leaves I -> B
    assert!(program.move_node(a, i, b).expect("move"));
    assert_eq!(program.get_node("B").expect("B").dependencies(), &[a]);
    assert_eq!(program.get_node("A").expect("A").dependencies(), &[i]);
    program.check_edge_symmetry().expect("symmetric after move");
}
