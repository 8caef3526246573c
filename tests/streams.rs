//! Streaming inputs: bounded and unbounded reducers, per-key sizing, and
//! the argument-protocol checks around them.

use std::sync::{Arc, Mutex};

use keyflow::prelude::*;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[test]
fn bounded_stream_of_four_folds_to_one_run() {
    init_tracing();
    let runs: Arc<Mutex<Vec<(u64, i64)>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = runs.clone();
    LocalCluster::new(1).run(move |world| {
        let numbers = Edge::<u64, i64>::new("numbers");
        let seen = seen.clone();
        let sink = make_tt(
            move |key: &u64, total: i64, _outs: &()| {
                seen.lock().unwrap().push((*key, total));
            },
            (numbers.clone(),),
            (),
            "sum",
            &["numbers"],
            &[],
            &world,
        )
        .unwrap();
        sink.set_input_reducer::<i64>(0, |acc, v| *acc += v);
        sink.set_static_argstream_size(0, 4);
        make_graph_executable(&sink);

        for v in [1, 2, 3, 4] {
            sink.invoke_with(0, (v,));
        }
        world.fence();
        assert_eq!(sink.pending_count(), 0);
    });
    assert_eq!(*runs.lock().unwrap(), vec![(0, 10)]);
}

#[test]
fn unbounded_stream_runs_after_finalize() {
    init_tracing();
    let runs: Arc<Mutex<Vec<(u64, i64)>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = runs.clone();
    LocalCluster::new(1).run(move |world| {
        let numbers = Edge::<u64, i64>::new("numbers");
        let seen = seen.clone();
        let sink = make_tt(
            move |key: &u64, total: i64, _outs: &()| {
                seen.lock().unwrap().push((*key, total));
            },
            (numbers.clone(),),
            (),
            "sum",
            &["numbers"],
            &[],
            &world,
        )
        .unwrap();
        sink.set_input_reducer::<i64>(0, |acc, v| *acc += v);
        make_graph_executable(&sink);

        sink.invoke_with(7, (5,));
        sink.invoke_with(7, (6,));
        assert_eq!(sink.pending_count(), 1);
        sink.inputs().0.finalize(&7);
        world.fence();
    });
    assert_eq!(*runs.lock().unwrap(), vec![(7, 11)]);
}

#[test]
fn stream_size_declared_mid_stream_completes_it() {
    init_tracing();
    let runs: Arc<Mutex<Vec<(u64, i64)>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = runs.clone();
    LocalCluster::new(1).run(move |world| {
        let numbers = Edge::<u64, i64>::new("numbers");
        let seen = seen.clone();
        let sink = make_tt(
            move |key: &u64, total: i64, _outs: &()| {
                seen.lock().unwrap().push((*key, total));
            },
            (numbers.clone(),),
            (),
            "sum",
            &["numbers"],
            &[],
            &world,
        )
        .unwrap();
        sink.set_input_reducer::<i64>(0, |acc, v| *acc += v);
        make_graph_executable(&sink);

        sink.invoke_with(3, (1,));
        sink.invoke_with(3, (2,));
        sink.inputs().0.set_size(&3, 3);
        sink.invoke_with(3, (3,));
        world.fence();
    });
    assert_eq!(*runs.lock().unwrap(), vec![(3, 6)]);
}

// Protocol-violation tests run on a single-rank world created in place so
// the panic surfaces on the test thread with its original message.

#[test]
#[should_panic(expected = "already bounded")]
fn rebounding_a_bounded_stream_panics() {
    let world = keyflow::initialize(1);
    let numbers = Edge::<u64, i64>::new("numbers");
    let sink = make_tt(
        |_key: &u64, _total: i64, _outs: &()| {},
        (numbers.clone(),),
        (),
        "sum",
        &["numbers"],
        &[],
        &world,
    )
    .unwrap();
    sink.set_input_reducer::<i64>(0, |acc, v| *acc += v);
    make_graph_executable(&sink);

    sink.inputs().0.set_size(&1, 2);
    sink.inputs().0.set_size(&1, 3);
}

#[test]
#[should_panic(expected = "more messages")]
fn declaring_a_size_below_received_count_panics() {
    let world = keyflow::initialize(1);
    let numbers = Edge::<u64, i64>::new("numbers");
    let sink = make_tt(
        |_key: &u64, _total: i64, _outs: &()| {},
        (numbers.clone(),),
        (),
        "sum",
        &["numbers"],
        &[],
        &world,
    )
    .unwrap();
    sink.set_input_reducer::<i64>(0, |acc, v| *acc += v);
    make_graph_executable(&sink);

    sink.invoke_with(1, (10,));
    sink.invoke_with(1, (20,));
    sink.inputs().0.set_size(&1, 1);
}

#[test]
#[should_panic(expected = "finalize called on bounded stream")]
fn finalizing_a_bounded_stream_panics() {
    let world = keyflow::initialize(1);
    let numbers = Edge::<u64, i64>::new("numbers");
    let sink = make_tt(
        |_key: &u64, _total: i64, _outs: &()| {},
        (numbers.clone(),),
        (),
        "sum",
        &["numbers"],
        &[],
        &world,
    )
    .unwrap();
    sink.set_input_reducer::<i64>(0, |acc, v| *acc += v);
    make_graph_executable(&sink);

    sink.inputs().0.set_size(&1, 2);
    sink.invoke_with(1, (10,));
    sink.inputs().0.finalize(&1);
}

#[test]
#[should_panic(expected = "already finalized")]
fn sending_into_a_finalized_stream_panics() {
    let world = keyflow::initialize(1);
    let numbers = Edge::<u64, i64>::new("numbers");
    let gate = Edge::<u64, ()>::new("gate");
    let sink = make_tt(
        |_key: &u64, _total: i64, _gate: (), _outs: &()| {},
        (numbers.clone(), gate.clone()),
        (),
        "sum",
        &["numbers", "gate"],
        &[],
        &world,
    )
    .unwrap();
    sink.set_input_reducer::<i64>(0, |acc, v| *acc += v);
    sink.set_static_argstream_size(0, 2);
    make_graph_executable(&sink);

    // The gate input never arrives, so the record stays pending with its
    // stream already complete; one more message is an error.
    sink.inputs().0.send_owned(&1, 10);
    sink.inputs().0.send_owned(&1, 20);
    sink.inputs().0.send_owned(&1, 30);
}
