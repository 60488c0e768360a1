use crate::engine::Engine;
use crate::routing::{HashPartitionRouter, PartitionRouter};
use crate::txn::{TxnRequest, TxnResponse};
use googletest::prelude::*;
use kst_common::config::{EngineConfig, SpeculationConfig};
use kst_common::error::{KstError, KstResult};
use kst_common::ids::{PartitionCount, PartitionId};
use kst_model::artifact::parse_model;
use kst_model::graph::PathModel;
use kst_storage::ops::{ExecResult, StoreOp};
use kst_storage::store::{InMemoryPartitionStore, PartitionStore};
use kst_storage::undo::UndoRecord;
use rstest::rstest;
use std::io::Write as _;
use std::time::Duration;

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
const DTXN_WINDOW: Duration = Duration::from_millis(400);
const MID_WINDOW: Duration = Duration::from_millis(100);

fn model_json() -> &'static str {
    r#"{
        "procedures": [
            {
                "name": "read_item",
                "start": 0,
                "states": [
                    {
                        "id": 0,
                        "edges": [
                            {
                                "to": 1,
                                "probability": 1.0,
                                "touches": [
                                    {"table": "item", "mode": "read", "scope": "base"}
                                ]
                            }
                        ]
                    },
                    {"id": 1}
                ]
            },
            {
                "name": "update_stock",
                "start": 0,
                "states": [
                    {
                        "id": 0,
                        "edges": [
                            {
                                "to": 1,
                                "probability": 1.0,
                                "touches": [
                                    {"table": "stock", "mode": "write", "scope": "base"}
                                ]
                            }
                        ]
                    },
                    {"id": 1}
                ]
            },
            {
                "name": "payment",
                "start": 0,
                "states": [
                    {
                        "id": 0,
                        "edges": [
                            {
                                "to": 1,
                                "probability": 1.0,
                                "touches": [
                                    {"table": "warehouse", "mode": "write", "scope": "base"},
                                    {"table": "stock", "mode": "write", "scope": "remote"}
                                ]
                            }
                        ]
                    },
                    {"id": 1}
                ]
            }
        ]
    }"#
}

fn test_model() -> PathModel {
    parse_model(model_json()).expect("test model must parse")
}

fn two_partition_config(speculation: SpeculationConfig) -> EngineConfig {
    EngineConfig {
        partition_count: PartitionCount::new(2).expect("literal is valid"),
        speculation,
    }
}

/// Finds a deterministic key owned by one specific partition.
fn key_for_partition(
    router: &HashPartitionRouter,
    partition: PartitionId,
    tag: &str,
) -> Vec<u8> {
    let mut suffix = 0_u32;
    loop {
        let key = format!("{tag}:{suffix}").into_bytes();
        if router.partition_for_key(&key) == partition {
            return key;
        }
        suffix += 1;
    }
}

fn read(table: &str, key: &[u8]) -> StoreOp {
    StoreOp::Read {
        table: table.to_owned(),
        key: key.to_vec(),
    }
}

fn write(table: &str, key: &[u8], value: &[u8]) -> StoreOp {
    StoreOp::Write {
        table: table.to_owned(),
        key: key.to_vec(),
        value: value.to_vec(),
    }
}

/// Store double injecting execution latency, standing in for the reference workload's
/// sleeper procedure occupying a partition for a fixed interval.
struct SlowStore {
    inner: InMemoryPartitionStore,
    delay: Duration,
}

impl PartitionStore for SlowStore {
    fn partition_id(&self) -> PartitionId {
        self.inner.partition_id()
    }

    fn execute(&mut self, ops: &[StoreOp]) -> KstResult<(ExecResult, UndoRecord)> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.inner.execute(ops)
    }

    fn apply_undo(&mut self, undo: UndoRecord) -> KstResult<()> {
        self.inner.apply_undo(undo)
    }
}

/// Engine whose partition 0 executes slowly, keeping a distributed transaction that
/// spans both partitions unresolved long enough for partition 1 to speculate.
fn slow_base_engine(speculation: SpeculationConfig) -> Engine {
    Engine::with_store_factory(
        two_partition_config(speculation),
        Some(test_model()),
        |partition| SlowStore {
            inner: InMemoryPartitionStore::new(partition),
            delay: if partition == 0 {
                DTXN_WINDOW
            } else {
                Duration::ZERO
            },
        },
    )
    .expect("engine must boot")
}

fn recv_response(ticket: &crate::engine::TxnTicket) -> TxnResponse {
    ticket
        .response
        .recv_timeout(RESPONSE_TIMEOUT)
        .expect("transaction must produce exactly one response")
}

/// Submits the payment transaction spanning both partitions, with partition 0 slow.
fn submit_spanning_payment(engine: &Engine) -> crate::engine::TxnTicket {
    let router = engine.router();
    let w0 = key_for_partition(router, 0, "warehouse");
    let w1 = key_for_partition(router, 1, "warehouse");
    engine
        .submit(TxnRequest::new(
            "payment",
            Vec::new(),
            vec![
                write("warehouse", &w0, b"paid-0"),
                write("warehouse", &w1, b"paid-1"),
            ],
        ))
        .expect("distributed submission must be accepted")
}

#[rstest]
fn single_partition_transaction_round_trips_without_speculation() {
    let engine = Engine::with_model(
        two_partition_config(SpeculationConfig::default()),
        Some(test_model()),
    )
    .expect("engine must boot");
    let key = key_for_partition(engine.router(), 1, "item");

    let ticket = engine
        .submit(TxnRequest::new(
            "read_item",
            Vec::new(),
            vec![write("item", &key, b"widget"), read("item", &key)],
        ))
        .expect("submission must be accepted");
    let response = recv_response(&ticket);

    assert_that!(response.txn_id, eq(ticket.txn_id));
    assert_that!(response.single_partition, eq(true));
    assert_that!(response.speculative, eq(false));
    let result = response.result.expect("execution must succeed");
    assert_that!(&result.outputs[1], eq(&Some(b"widget".to_vec())));
}

#[rstest]
fn transactions_during_blocked_window_report_speculative_and_later_ones_do_not() {
    let engine = slow_base_engine(SpeculationConfig::default());
    let router = engine.router();
    let item_key = key_for_partition(router, 1, "item");

    let dtxn = submit_spanning_payment(&engine);
    std::thread::sleep(MID_WINDOW);

    // Disjoint single-partition reads at the blocked partition speculate.
    let mut window_tickets = Vec::new();
    for _ in 0..3 {
        let ticket = engine
            .submit(TxnRequest::new(
                "read_item",
                Vec::new(),
                vec![read("item", &item_key)],
            ))
            .expect("submission must be accepted");
        window_tickets.push(ticket);
    }

    let dtxn_response = recv_response(&dtxn);
    assert_that!(dtxn_response.single_partition, eq(false));
    assert_that!(dtxn_response.speculative, eq(false));
    assert_that!(dtxn_response.result.is_ok(), eq(true));

    for ticket in &window_tickets {
        let response = recv_response(ticket);
        assert_that!(response.single_partition, eq(true));
        assert_that!(response.speculative, eq(true));
        assert_that!(response.result.is_ok(), eq(true));
    }

    // After resolution the partition is idle again; nothing is speculative.
    let after = engine
        .submit(TxnRequest::new(
            "read_item",
            Vec::new(),
            vec![read("item", &item_key)],
        ))
        .expect("submission must be accepted");
    let response = recv_response(&after);
    assert_that!(response.speculative, eq(false));
}

#[rstest]
fn conflicting_transactions_wait_for_resolution_instead_of_speculating() {
    let engine = slow_base_engine(SpeculationConfig::default());
    let router = engine.router();
    let stock_key = key_for_partition(router, 1, "stock");

    let dtxn = submit_spanning_payment(&engine);
    std::thread::sleep(MID_WINDOW);

    // `update_stock` collides with payment's predicted remote stock write.
    let conflicting = engine
        .submit(TxnRequest::new(
            "update_stock",
            Vec::new(),
            vec![write("stock", &stock_key, b"9")],
        ))
        .expect("submission must be accepted");

    let dtxn_response = recv_response(&dtxn);
    assert_that!(dtxn_response.result.is_ok(), eq(true));

    let response = recv_response(&conflicting);
    assert_that!(response.speculative, eq(false));
    assert_that!(response.result.is_ok(), eq(true));
}

#[rstest]
fn cancelled_distributed_transaction_rolls_speculation_back() {
    let engine = slow_base_engine(SpeculationConfig::default());
    let router = engine.router();
    let item_key = key_for_partition(router, 1, "item");
    let w1 = key_for_partition(router, 1, "warehouse");

    let dtxn = submit_spanning_payment(&engine);
    std::thread::sleep(MID_WINDOW);

    let speculated = engine
        .submit(TxnRequest::new(
            "read_item",
            Vec::new(),
            vec![read("item", &item_key)],
        ))
        .expect("submission must be accepted");

    engine
        .cancel(dtxn.txn_id, "client timeout")
        .expect("cancel must be accepted");

    let dtxn_response = recv_response(&dtxn);
    assert_that!(dtxn_response.single_partition, eq(false));
    assert_that!(dtxn_response.speculative, eq(false));
    assert_that!(
        matches!(dtxn_response.result, Err(KstError::Aborted(_, _))),
        eq(true)
    );

    // The speculative result was discarded with the rollback sweep; the re-executed
    // run responds non-speculatively.
    let response = recv_response(&speculated);
    assert_that!(response.speculative, eq(false));
    assert_that!(response.result.is_ok(), eq(true));

    // The aborted transaction's warehouse write must not be visible.
    let probe = engine
        .submit(TxnRequest::new(
            "read_item",
            Vec::new(),
            vec![read("warehouse", &w1)],
        ))
        .expect("submission must be accepted");
    let probe_response = recv_response(&probe);
    let result = probe_response.result.expect("probe must succeed");
    assert_that!(&result.outputs[0], eq(&None));
}

#[rstest]
fn conservative_configuration_never_produces_speculative_responses() {
    let engine = slow_base_engine(SpeculationConfig {
        use_model: false,
        ignore_all_local: false,
        ..SpeculationConfig::default()
    });
    let router = engine.router();
    let item_key = key_for_partition(router, 1, "item");

    let dtxn = submit_spanning_payment(&engine);
    std::thread::sleep(MID_WINDOW);

    let mut tickets = Vec::new();
    for _ in 0..3 {
        tickets.push(
            engine
                .submit(TxnRequest::new(
                    "read_item",
                    Vec::new(),
                    vec![read("item", &item_key)],
                ))
                .expect("submission must be accepted"),
        );
    }

    assert_that!(recv_response(&dtxn).result.is_ok(), eq(true));
    for ticket in &tickets {
        let response = recv_response(ticket);
        assert_that!(response.speculative, eq(false));
        assert_that!(response.result.is_ok(), eq(true));
    }
}

#[rstest]
fn ignore_all_local_speculates_without_model_coverage() {
    let engine = slow_base_engine(SpeculationConfig {
        use_model: false,
        ignore_all_local: true,
        ..SpeculationConfig::default()
    });
    let router = engine.router();
    let aux_key = key_for_partition(router, 1, "aux");

    let dtxn = submit_spanning_payment(&engine);
    std::thread::sleep(MID_WINDOW);

    // The procedure is untrained, but routing proves the transaction local, so the
    // bypass admits it without consulting any model.
    let local = engine
        .submit(TxnRequest::new(
            "untrained_local",
            Vec::new(),
            vec![write("aux", &aux_key, b"fast-path")],
        ))
        .expect("submission must be accepted");

    assert_that!(recv_response(&dtxn).result.is_ok(), eq(true));
    let response = recv_response(&local);
    assert_that!(response.speculative, eq(true));
    assert_that!(response.result.is_ok(), eq(true));
}

#[rstest]
fn engine_loads_model_artifact_from_configured_path() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file must be creatable");
    file.write_all(model_json().as_bytes())
        .expect("artifact must be writable");

    let config = EngineConfig {
        partition_count: PartitionCount::new(2).expect("literal is valid"),
        speculation: SpeculationConfig {
            model_path: Some(file.path().to_path_buf()),
            ..SpeculationConfig::default()
        },
    };
    let engine = Engine::new(config).expect("engine must boot from artifact");

    let key = key_for_partition(engine.router(), 0, "item");
    let ticket = engine
        .submit(TxnRequest::new(
            "read_item",
            Vec::new(),
            vec![read("item", &key)],
        ))
        .expect("submission must be accepted");
    assert_that!(recv_response(&ticket).result.is_ok(), eq(true));
}

#[rstest]
fn multi_hop_distributed_transaction_commits_with_hop_barriers() {
    let engine = Engine::with_model(
        two_partition_config(SpeculationConfig::default()),
        Some(test_model()),
    )
    .expect("engine must boot");
    let router = engine.router();
    let w0 = key_for_partition(router, 0, "warehouse");
    let w1 = key_for_partition(router, 1, "warehouse");

    let ticket = engine
        .submit(TxnRequest::with_hops(
            "payment",
            Vec::new(),
            vec![
                vec![
                    write("warehouse", &w0, b"hop0-p0"),
                    write("warehouse", &w1, b"hop0-p1"),
                ],
                vec![read("warehouse", &w1)],
            ],
        ))
        .expect("submission must be accepted");

    let response = recv_response(&ticket);
    assert_that!(response.single_partition, eq(false));
    let result = response.result.expect("distributed commit must succeed");
    // Two writes in hop 0, one read in hop 1, folded in partition order per hop.
    assert_that!(result.outputs.len(), eq(3_usize));
    assert_that!(&result.outputs[2], eq(&Some(b"hop0-p1".to_vec())));
}
