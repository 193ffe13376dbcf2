//! Ordering behaviour on a small ports-like dependency set.
//!
//! Build edges are inserted first; test edges are inserted afterwards and
//! only kept when they do not close a cycle, mirroring how a scheduler can
//! separate hard build ordering from softer test gating.

use convenient_graph::{DAG, GraphError, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Build,
    Run,
    Test,
}

struct Fixture {
    dag: DAG<&'static str, Kind>,
    ids: Vec<NodeId>,
}

fn fixture() -> Fixture {
    let mut dag = DAG::new();
    // 0 python, 1 pytest, 2 py-lib, 3 app
    let ids = vec![
        dag.add_node("lang/python"),
        dag.add_node("devel/py-pytest"),
        dag.add_node("devel/py-lib"),
        dag.add_node("www/app"),
    ];

    dag.add_edge(ids[0], ids[1], Kind::Build).unwrap();
    dag.add_edge(ids[0], ids[2], Kind::Build).unwrap();
    dag.add_edge(ids[2], ids[1], Kind::Run).unwrap();
    dag.add_edge(ids[2], ids[3], Kind::Build).unwrap();

    Fixture { dag, ids }
}

#[test]
fn test_build_order_respects_all_edges() {
    let Fixture { dag, ids } = fixture();
    let order = dag.topological_sort();
    let pos = |id: NodeId| order.iter().position(|&x| x == id).unwrap();

    assert_eq!(order.len(), 4);
    assert!(pos(ids[0]) < pos(ids[2]));
    assert!(pos(ids[2]) < pos(ids[1]));
    assert!(pos(ids[2]) < pos(ids[3]));
}

#[test]
fn test_cyclic_test_edge_is_rejected_but_acyclic_one_is_kept() {
    let Fixture { mut dag, ids } = fixture();

    // py-lib is tested with pytest, which itself runs on py-lib
    let cyclic = dag.add_edge(ids[1], ids[2], Kind::Test);
    match cyclic {
        Err(GraphError::CycleDetected { path, .. }) => {
            assert_eq!(path, vec![ids[2], ids[1]]);
        }
        other => panic!("expected a cycle, got {other:?}"),
    }

    // app is tested with pytest too, which is fine
    dag.add_edge(ids[1], ids[3], Kind::Test).unwrap();

    let kinds: Vec<Kind> = dag
        .incoming_edges(ids[3])
        .unwrap()
        .iter()
        .map(|(_, kind)| *kind)
        .collect();
    assert_eq!(kinds, vec![Kind::Build, Kind::Test]);
    assert_eq!(
        dag.layers(),
        vec![vec![ids[0]], vec![ids[2]], vec![ids[1]], vec![ids[3]]]
    );
}

#[test]
fn test_priority_inputs() {
    let Fixture { dag, ids } = fixture();
    assert_eq!(dag.transitive_dependent_count(ids[0]).unwrap(), 3);
    assert_eq!(dag.transitive_dependent_count(ids[2]).unwrap(), 2);
    assert_eq!(dag.transitive_dependent_count(ids[3]).unwrap(), 0);
}
