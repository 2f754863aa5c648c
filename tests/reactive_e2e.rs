use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use kyroql_reasoner::{
    ExecutionError, ReactiveConfig, ReactiveError, ReactiveNetwork, RecordingTracer, TraceEvent,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config() -> ReactiveConfig {
    ReactiveConfig {
        answer_timeout_ms: 5_000,
        ..ReactiveConfig::default()
    }
}

#[test]
fn map_transforms_every_packet_and_balances_ledger() {
    init_tracing();
    let mut network = ReactiveNetwork::<u32>::new(config()).unwrap();
    let block = network.spawn_block().unwrap();

    let source = block.source(|| vec![1, 2, 3]).unwrap();
    let map = source.map(|x| x + 1).unwrap();
    let mut answers = block.sink(&map).unwrap();

    assert_eq!(answers.collect_remaining().unwrap(), vec![2, 3, 4]);
    assert!(answers.is_finished());
    assert_eq!(answers.next_answer().unwrap(), None);

    let ledger = network.ledger().unwrap();
    assert_eq!(ledger.count(&source.identifier()).created, 3);
    assert_eq!(ledger.count(&map.identifier()).created, 0);
    assert_eq!(ledger.count(&answers.identifier()).consumed, 3);
    assert_eq!(ledger.total_created(), ledger.total_consumed());
    assert!(ledger.finished_sources.contains(&source.identifier()));
}

#[test]
fn flat_map_accounts_inputs_and_outputs() {
    init_tracing();
    let mut network = ReactiveNetwork::<u32>::new(config()).unwrap();
    let block = network.spawn_block().unwrap();

    let source = block.source(|| vec![5]).unwrap();
    let twice = source.flat_map(|x| vec![x, x]).unwrap();
    let mut answers = block.sink(&twice).unwrap();

    assert_eq!(answers.collect_remaining().unwrap(), vec![5, 5]);

    let ledger = network.ledger().unwrap();
    let count = ledger.count(&twice.identifier());
    assert_eq!((count.created, count.consumed), (2, 1));
    assert_eq!(ledger.outstanding(ledger.counts.keys()), 0);
}

#[test]
fn flat_map_fan_out_creates_n_times_k_answers() {
    init_tracing();
    let mut network = ReactiveNetwork::<u32>::new(config()).unwrap();
    let block = network.spawn_block().unwrap();

    let inputs = vec![1, 2, 3, 4];
    let k = 3;
    let source = block.source(move || inputs).unwrap();
    let expanded = source.flat_map(move |x| vec![x; k]).unwrap();
    let mut answers = block.sink(&expanded).unwrap();

    let received = answers.collect_remaining().unwrap();
    assert_eq!(received.len(), 4 * k);
    assert_eq!(received, vec![1, 1, 1, 2, 2, 2, 3, 3, 3, 4, 4, 4]);

    let ledger = network.ledger().unwrap();
    let count = ledger.count(&expanded.identifier());
    assert_eq!(count.created, 12);
    assert_eq!(count.consumed, 4);
    assert_eq!(ledger.count(&answers.identifier()).consumed, 12);
}

#[test]
fn flat_map_with_empty_output_retries_upstream() {
    init_tracing();
    let mut network = ReactiveNetwork::<u32>::new(config()).unwrap();
    let block = network.spawn_block().unwrap();

    let source = block.source(|| 1..=6).unwrap();
    let odd = source
        .flat_map(|x| if x % 2 == 1 { vec![x * 10] } else { Vec::new() })
        .unwrap();
    let mut answers = block.sink(&odd).unwrap();

    assert_eq!(answers.collect_remaining().unwrap(), vec![10, 30, 50]);
    let ledger = network.ledger().unwrap();
    assert_eq!(ledger.count(&odd.identifier()).consumed, 6);
    assert_eq!(ledger.count(&odd.identifier()).created, 3);
}

#[test]
fn distinct_suppresses_duplicates() {
    init_tracing();
    let mut network = ReactiveNetwork::<u32>::new(config()).unwrap();
    let block = network.spawn_block().unwrap();

    let source = block.source(|| vec![1, 1, 2, 1, 3, 2]).unwrap();
    let distinct = source.distinct().unwrap();
    let mut answers = block.sink(&distinct).unwrap();

    assert_eq!(answers.collect_remaining().unwrap(), vec![1, 2, 3]);
    let ledger = network.ledger().unwrap();
    assert_eq!(ledger.count(&distinct.identifier()).consumed, 3);
}

#[test]
fn buffer_replays_to_late_subscriber_without_recomputing() {
    init_tracing();
    let tracer = Arc::new(RecordingTracer::<u32>::new());
    let mut network = ReactiveNetwork::<u32>::with_tracer(config(), tracer.clone()).unwrap();
    let block = network.spawn_block().unwrap();

    let source = block.source(|| vec![42]).unwrap();
    let buffer = source.buffer().unwrap();
    let mut first = block.sink(&buffer).unwrap();
    assert_eq!(first.next_answer().unwrap(), Some(42));

    let mut late = block.sink(&buffer).unwrap();
    assert_eq!(late.next_answer().unwrap(), Some(42));
    assert_eq!(tracer.pull_count(&source.identifier()), 1, "replay must not pull the source");

    assert_eq!(late.next_answer().unwrap(), None);
    assert_eq!(first.next_answer().unwrap(), None);

    let received = tracer.received_by(&late.identifier());
    assert_eq!(received, vec![42]);
    let ledger = network.ledger().unwrap();
    assert_eq!(ledger.edge_count(&buffer.identifier(), &first.identifier()), 1);
    assert_eq!(ledger.edge_count(&buffer.identifier(), &late.identifier()), 1);
    assert_eq!(ledger.total_created(), ledger.total_consumed());
}

#[test]
fn buffer_with_two_sinks_finishes_both() {
    init_tracing();
    let mut network = ReactiveNetwork::<u32>::new(config()).unwrap();
    let block = network.spawn_block().unwrap();

    let source = block.source(|| vec![1, 2]).unwrap();
    let buffer = source.buffer().unwrap();
    let mut left = block.sink(&buffer).unwrap();
    let mut right = block.sink(&buffer).unwrap();

    let wait = Duration::from_secs(2);
    for expected in [1, 2] {
        assert_eq!(left.next_timeout(wait).unwrap(), Some(expected));
        assert_eq!(right.next_timeout(wait).unwrap(), Some(expected));
    }
    assert_eq!(left.next_timeout(wait).unwrap(), None);
    assert_eq!(right.next_timeout(wait).unwrap(), None);

    let ledger = network.ledger().unwrap();
    assert_eq!(ledger.count(&source.identifier()).created, 2, "the source runs once for both sinks");
    assert_eq!(ledger.edge_count(&buffer.identifier(), &left.identifier()), 2);
    assert_eq!(ledger.edge_count(&buffer.identifier(), &right.identifier()), 2);
    assert_eq!(ledger.total_created(), ledger.total_consumed());
}

#[test]
fn buffer_sinks_drained_one_after_another_both_finish() {
    init_tracing();
    let mut network = ReactiveNetwork::<u32>::new(config()).unwrap();
    let block = network.spawn_block().unwrap();

    let source = block.source(|| vec![4, 5, 6]).unwrap();
    let buffer = source.buffer().unwrap();
    let mut left = block.sink(&buffer).unwrap();
    let mut right = block.sink(&buffer).unwrap();

    assert_eq!(left.collect_remaining().unwrap(), vec![4, 5, 6]);
    assert_eq!(right.collect_remaining().unwrap(), vec![4, 5, 6]);
    assert!(left.is_finished());
    assert!(right.is_finished());
}

#[test]
fn cyclic_network_computes_transitive_closure_and_terminates() {
    init_tracing();
    let edges: HashMap<u32, Vec<u32>> = HashMap::from([(1, vec![2]), (2, vec![3]), (3, vec![4]), (4, vec![2])]);
    let successors = {
        let edges = edges.clone();
        move |node: u32| edges.get(&node).cloned().unwrap_or_default()
    };

    let mut network = ReactiveNetwork::<u32>::new(config()).unwrap();
    let block = network.spawn_block().unwrap();

    // reachable(1): seed with the direct successors, then follow edges until
    // no new node shows up
    let seed = block.source(move || edges.get(&1).cloned().unwrap_or_default()).unwrap();
    let merge = block.merge().unwrap();
    seed.subscribe(&merge).unwrap();
    let distinct = merge.distinct().unwrap();
    let buffer = distinct.buffer().unwrap();
    let step = buffer.flat_map(successors).unwrap();
    step.subscribe(&merge).unwrap();
    let mut answers = block.sink(&buffer).unwrap();

    let reached: HashSet<u32> = answers.collect_remaining().unwrap().into_iter().collect();
    assert_eq!(reached, HashSet::from([2, 3, 4]));

    let ledger = network.ledger().unwrap();
    assert_eq!(ledger.total_created(), ledger.total_consumed());
    assert_eq!(ledger.count(&distinct.identifier()).consumed, 1);
}

#[test]
fn stages_in_different_blocks_exchange_packets() {
    init_tracing();
    let mut network = ReactiveNetwork::<u32>::new(config()).unwrap();
    let left = network.spawn_block().unwrap();
    let right = network.spawn_block().unwrap();

    let source = left.source(|| vec![7, 8, 9]).unwrap();
    let merge = right.merge().unwrap();
    source.subscribe(&merge).unwrap();
    let doubled = merge.map(|x| x * 2).unwrap();
    let mut answers = left.sink(&doubled).unwrap();

    assert_eq!(answers.collect_remaining().unwrap(), vec![14, 16, 18]);
    assert_eq!(doubled.block().id(), right.id());
    assert_eq!(network.blocks().len(), 2);
}

#[test]
fn second_subscriber_on_single_stage_is_rejected() {
    init_tracing();
    let mut network = ReactiveNetwork::<u32>::new(config()).unwrap();
    let block = network.spawn_block().unwrap();

    let source = block.source(|| vec![1]).unwrap();
    let map = source.map(|x| x).unwrap();
    let _first = map.distinct().unwrap();
    let err = map.distinct().unwrap_err();

    assert!(err.is_invariant_violation(), "unexpected error: {err}");
    let snapshot = map.inspect().unwrap();
    assert_eq!(snapshot.subscribers.len(), 1);
}

#[test]
fn panicking_stage_is_contained() {
    init_tracing();
    let mut network = ReactiveNetwork::<u32>::new(config()).unwrap();
    let block = network.spawn_block().unwrap();

    let source = block.source(|| vec![1, 2, 3]).unwrap();
    let fragile = source
        .map(|x| {
            if x == 2 {
                panic!("cannot handle {x}");
            }
            x
        })
        .unwrap();
    let mut answers = block.sink(&fragile).unwrap();

    assert_eq!(answers.collect_remaining().unwrap(), vec![1, 3]);
    let ledger = network.ledger().unwrap();
    assert_eq!(ledger.count(&fragile.identifier()).consumed, 1);
    assert!(ledger.terminated.is_none());
}

#[test]
fn panicking_source_closes_instead_of_hanging() {
    init_tracing();
    let mut network = ReactiveNetwork::<u32>::new(config()).unwrap();
    let block = network.spawn_block().unwrap();

    let source = block
        .source(|| {
            (0..3).map(|x| {
                if x == 1 {
                    panic!("row {x} is corrupt");
                }
                x
            })
        })
        .unwrap();
    let mut answers = block.sink(&source).unwrap();

    let wait = Duration::from_secs(2);
    assert_eq!(answers.next_timeout(wait).unwrap(), Some(0));
    assert_eq!(answers.next_timeout(wait).unwrap(), None);

    let ledger = network.ledger().unwrap();
    assert!(ledger.finished_sources.contains(&source.identifier()));
    assert!(ledger.terminated.is_none());
    assert_eq!(ledger.total_created(), ledger.total_consumed());
}

#[test]
fn terminated_resolution_surfaces_on_the_stream() {
    init_tracing();
    let mut network = ReactiveNetwork::<u32>::new(config()).unwrap();
    let block = network.spawn_block().unwrap();

    let source = block.source(|| vec![1]).unwrap();
    let mut answers = block.sink(&source).unwrap();
    network.monitor().terminate("query cancelled");
    let ledger = network.ledger().unwrap();
    assert_eq!(ledger.terminated.as_deref(), Some("query cancelled"));

    let err = answers.next_answer().unwrap_err();
    assert!(matches!(
        err,
        ReactiveError::Execution(ExecutionError::Terminated { ref cause }) if cause == "query cancelled"
    ));
    assert!(answers.next_answer().is_err());
    assert!(answers.next().is_none());
}

#[test]
fn root_without_source_times_out() {
    init_tracing();
    let mut network = ReactiveNetwork::<u32>::new(config()).unwrap();
    let block = network.spawn_block().unwrap();

    let merge = block.merge().unwrap();
    let mut answers = block.sink(&merge).unwrap();

    let err = answers.next_timeout(Duration::from_millis(50)).unwrap_err();
    assert!(err.is_retryable());
    let snapshot = merge.inspect().unwrap();
    assert!(snapshot.pulling_subscribers.contains(&answers.identifier()));
}

#[test]
fn pulls_are_answered_one_at_a_time() {
    init_tracing();
    let tracer = Arc::new(RecordingTracer::<u32>::new());
    let mut network = ReactiveNetwork::<u32>::with_tracer(config(), tracer.clone()).unwrap();
    let block = network.spawn_block().unwrap();

    let source = block.source(|| 0..1_000).unwrap();
    let map = source.map(|x| x + 1).unwrap();
    let mut answers = block.sink(&map).unwrap();

    assert_eq!(answers.next_answer().unwrap(), Some(1));
    assert_eq!(answers.next_answer().unwrap(), Some(2));
    // the engine never runs ahead of demand
    assert_eq!(tracer.pull_count(&source.identifier()), 2);

    let pulls_into_map = tracer
        .events()
        .iter()
        .filter(|e| matches!(e, TraceEvent::Pull { publisher, .. } if *publisher == map.identifier()))
        .count();
    assert_eq!(pulls_into_map, 2);
}

#[test]
fn file_tracer_records_the_run() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let trace_path;
    {
        let mut network = ReactiveNetwork::<u32>::new(config().with_trace_dir(dir.path())).unwrap();
        trace_path = dir.path().join(format!("{}.dot", network.name()));
        let block = network.spawn_block().unwrap();
        let source = block.source(|| vec![3]).unwrap();
        let mut answers = block.sink(&source).unwrap();
        assert_eq!(answers.collect_remaining().unwrap(), vec![3]);
    }

    let text = std::fs::read_to_string(trace_path).unwrap();
    assert!(text.contains("digraph {"));
    assert!(text.contains("label=\"pull\""));
    assert!(text.contains("label=\"3\""));
    assert!(text.trim_end().ends_with('}'));
}
