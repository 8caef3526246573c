//! Tree compress/reconstruct round trip: a bottom-up reduction with
//! static-size-2 streaming inputs followed by a top-down scatter. With
//! constant leaf data the reconstructed leaves equal the originals.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use keyflow::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
struct Node {
    level: u32,
    idx: u64,
}

const LEAF_LEVEL: u32 = 2;
const BLOCK: usize = 4;

fn parent(node: &Node) -> Node {
    Node {
        level: node.level - 1,
        idx: node.idx / 2,
    }
}

fn children(node: &Node) -> [Node; 2] {
    [
        Node {
            level: node.level + 1,
            idx: node.idx * 2,
        },
        Node {
            level: node.level + 1,
            idx: node.idx * 2 + 1,
        },
    ]
}

fn leaves() -> Vec<Node> {
    (0..1u64 << LEAF_LEVEL)
        .map(|idx| Node {
            level: LEAF_LEVEL,
            idx,
        })
        .collect()
}

#[test]
fn compress_then_reconstruct_preserves_constant_leaves() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let compressed: Arc<Mutex<HashMap<Node, Vec<f64>>>> = Arc::new(Mutex::new(HashMap::new()));
    let rebuilt: Arc<Mutex<HashMap<Node, Vec<f64>>>> = Arc::new(Mutex::new(HashMap::new()));
    let coeffs = compressed.clone();
    let result = rebuilt.clone();
    LocalCluster::new(2).run(move |world| {
        let up = Edge::<Node, Vec<f64>>::new("up");
        let down = Edge::<Node, Vec<f64>>::new("down");

        // Bottom-up: each internal node folds its two children and passes
        // the average one level up through the same template.
        let coeffs_handle = coeffs.clone();
        let compress = make_tt(
            move |node: &Node, sum: Vec<f64>, outs: &(Out<Node, Vec<f64>>,)| {
                let avg: Vec<f64> = sum.iter().map(|x| x / 2.0).collect();
                coeffs_handle.lock().unwrap().insert(*node, avg.clone());
                if node.level > 0 {
                    outs.0.send(&parent(node), avg);
                }
            },
            (up.clone(),),
            (up.clone(),),
            "compress",
            &["children"],
            &["parent"],
            &world,
        )
        .unwrap();
        compress.set_input_reducer::<Vec<f64>>(0, |acc, v| {
            for (a, b) in acc.iter_mut().zip(v) {
                *a += b;
            }
        });
        compress.set_static_argstream_size(0, 2);

        // Top-down: each node forwards its value to both children; leaves
        // record theirs.
        let result = result.clone();
        let reconstruct = make_tt(
            move |node: &Node, value: Vec<f64>, outs: &(Out<Node, Vec<f64>>,)| {
                if node.level == LEAF_LEVEL {
                    result.lock().unwrap().insert(*node, value);
                } else {
                    for child in children(node) {
                        outs.0.send(&child, value.clone());
                    }
                }
            },
            (down.clone(),),
            (down.clone(),),
            "reconstruct",
            &["parent"],
            &["children"],
            &world,
        )
        .unwrap();

        make_graph_executable(&compress);
        make_graph_executable(&reconstruct);

        if world.rank() == 0 {
            for leaf in leaves() {
                compress
                    .inputs()
                    .0
                    .send_owned(&parent(&leaf), vec![1.0; BLOCK]);
            }
        }
        world.fence();
        assert_eq!(compress.pending_count(), 0);

        let root = Node { level: 0, idx: 0 };
        let root_value = coeffs
            .lock()
            .unwrap()
            .get(&root)
            .expect("compress reached the root")
            .clone();
        if world.rank() == 0 {
            reconstruct.invoke_with(root, (root_value,));
        }
        world.fence();
        assert_eq!(reconstruct.pending_count(), 0);
    });

    let compressed = compressed.lock().unwrap();
    // 2 internal nodes at level 1 plus the root
    assert_eq!(compressed.len(), 3);

    let rebuilt = rebuilt.lock().unwrap();
    assert_eq!(rebuilt.len(), leaves().len());
    for leaf in leaves() {
        let values = &rebuilt[&leaf];
        assert_eq!(values.len(), BLOCK);
        for value in values {
            assert!((value - 1.0).abs() < 1e-12);
        }
    }
}
