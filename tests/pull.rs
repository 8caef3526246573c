//! Pull-edge protocol: on-demand fetch from a container, remote requests,
//! and eager-vs-lazy equivalence.

use std::sync::{Arc, Mutex};

use keyflow::prelude::*;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[test]
fn pull_input_fetches_from_a_remote_container() {
    init_tracing();
    let runs: Arc<Mutex<Vec<(usize, u64, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = runs.clone();
    LocalCluster::new(2).run(move |world| {
        // The container lives on rank 0: k -> 10 * k, identity mapper.
        let table = Edge::<u64, u64>::pull("table", |ck: &u64| Some(ck * 10), |_ck| 0, |k: &u64| *k);
        let seen = seen.clone();
        let here = world.clone();
        let puller = make_tt(
            move |key: &u64, value: u64, _outs: &()| {
                seen.lock().unwrap().push((here.rank(), *key, value));
            },
            (table.clone(),),
            (),
            "puller",
            &["table"],
            &[],
            &world,
        )
        .unwrap();
        puller.set_keymap(|key| (*key % 2) as usize);
        make_graph_executable(&puller);

        if world.rank() == 1 {
            puller.invoke(7);
        }
        world.fence();
        assert_eq!(puller.pending_count(), 0);
    });
    assert_eq!(*runs.lock().unwrap(), vec![(1, 7, 70)]);
}

#[test]
fn local_container_is_read_without_messaging() {
    init_tracing();
    let runs: Arc<Mutex<Vec<(u64, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = runs.clone();
    LocalCluster::new(1).run(move |world| {
        let table =
            Edge::<u64, u64>::pull("table", |ck: &u64| Some(ck + 100), |_ck| 0, |k: &u64| k * 2);
        let seen = seen.clone();
        let puller = make_tt(
            move |key: &u64, value: u64, _outs: &()| {
                seen.lock().unwrap().push((*key, value));
            },
            (table.clone(),),
            (),
            "puller",
            &["table"],
            &[],
            &world,
        )
        .unwrap();
        make_graph_executable(&puller);
        puller.invoke(4);
        world.fence();
    });
    // mapper doubles the key, container adds 100
    assert_eq!(*runs.lock().unwrap(), vec![(4, 108)]);
}

fn run_mixed_inputs(lazy: bool) -> Vec<(u64, i32, u64)> {
    let runs: Arc<Mutex<Vec<(u64, i32, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = runs.clone();
    LocalCluster::new(2).run(move |world| {
        let pushes = Edge::<u64, i32>::new("pushes");
        let table = Edge::<u64, u64>::pull("table", |ck: &u64| Some(ck * 3), |_ck| 0, |k: &u64| *k);
        let seen = seen.clone();
        let joined = make_tt(
            move |key: &u64, pushed: i32, pulled: u64, _outs: &()| {
                seen.lock().unwrap().push((*key, pushed, pulled));
            },
            (pushes.clone(), table.clone()),
            (),
            "joined",
            &["pushes", "table"],
            &[],
            &world,
        )
        .unwrap();
        joined.set_keymap(|key| (*key % 2) as usize);
        joined.set_lazy_pull(lazy);
        make_graph_executable(&joined);

        if world.rank() == 0 {
            for key in 0..6u64 {
                joined.inputs().0.send_owned(&key, key as i32 - 3);
            }
        }
        world.fence();
        assert_eq!(joined.pending_count(), 0);
    });
    let mut runs = runs.lock().unwrap().clone();
    runs.sort_unstable();
    runs
}

#[test]
fn lazy_and_eager_pull_agree_for_pure_containers() {
    init_tracing();
    let eager = run_mixed_inputs(false);
    let lazy = run_mixed_inputs(true);
    assert_eq!(eager, lazy);
    assert_eq!(eager.len(), 6);
    for (key, pushed, pulled) in eager {
        assert_eq!(pushed, key as i32 - 3);
        assert_eq!(pulled, key * 3);
    }
}

#[test]
#[should_panic(expected = "container lookup miss")]
fn container_miss_is_a_protocol_error() {
    // Single-rank world created in place so the panic surfaces on the
    // test thread with its original message.
    let world = keyflow::initialize(1);
    let table = Edge::<u64, u64>::pull("table", |_ck: &u64| None, |_ck| 0, |k: &u64| *k);
    let puller = make_tt(
        |_key: &u64, _value: u64, _outs: &()| {},
        (table.clone(),),
        (),
        "puller",
        &["table"],
        &[],
        &world,
    )
    .unwrap();
    make_graph_executable(&puller);
    puller.invoke(1);
}
