/* End-to-end scenarios run against the public API with the bundled NOP reference driver.
 * Grounded in original_source/test/driver/nop.c's stated purpose: exercising the driver core
 * without a real protocol driver. */
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hound::driver::nop::{self, NopDriver};
use hound::driver::DriverOps;
use hound::{ContextRequest, DataId, DevId, Engine, HoundError, Record};

fn engine_with_nop_at(path: &str) -> (Engine, DevId) {
    let engine = Engine::new();
    engine
        .register("nop", Box::new(|| Box::new(NopDriver::new()) as Box<dyn DriverOps>))
        .unwrap();
    let dev_id = engine
        .init_driver_with_schema("nop", path, &[], nop::schema_descs())
        .unwrap();
    (engine, dev_id)
}

fn counting_callback() -> (hound::Callback, Arc<Mutex<Vec<u64>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&seen);
    let cb: hound::Callback = Box::new(move |rec: &Record| {
        recorder.lock().unwrap().push(rec.seqno);
    });
    (cb, seen)
}

/// Scenario 1: NOP driver, one context, on-demand read.
#[test]
fn scenario_one_context_on_demand() {
    let (engine, dev_id) = engine_with_nop_at("/dev/nop0");
    let (cb, seen) = counting_callback();
    let ctx = engine
        .context_alloc(ContextRequest {
            queue_len: 8,
            callback: Some(cb),
            data_rq: vec![(nop::ACCEL_ID, 0)],
        })
        .unwrap();
    ctx.start().unwrap();

    ctx.read(1).unwrap();

    let seqnos = seen.lock().unwrap().clone();
    assert_eq!(seqnos, vec![0]);
    assert_eq!(engine.get_dev_name(dev_id).unwrap(), Some("dummy".to_string()));
}

/// Scenario 2: two contexts fanning out to the same data id see identical
/// sequences with no drops.
#[test]
fn scenario_two_context_fanout() {
    let (engine, _dev_id) = engine_with_nop_at("/dev/nop1");

    let (cb_a, seen_a) = counting_callback();
    let ctx_a = engine
        .context_alloc(ContextRequest {
            queue_len: 10,
            callback: Some(cb_a),
            data_rq: vec![(nop::ACCEL_ID, 0)],
        })
        .unwrap();
    ctx_a.start().unwrap();

    let (cb_b, seen_b) = counting_callback();
    let ctx_b = engine
        .context_alloc(ContextRequest {
            queue_len: 10,
            callback: Some(cb_b),
            data_rq: vec![(nop::ACCEL_ID, 0)],
        })
        .unwrap();
    ctx_b.start().unwrap();

    ctx_a.next(5).unwrap();
    std::thread::sleep(Duration::from_millis(100));
    ctx_a.read_all_nowait();
    ctx_b.read_all_nowait();

    let a = seen_a.lock().unwrap().clone();
    let b = seen_b.lock().unwrap().clone();
    assert_eq!(a.len(), 5);
    assert_eq!(a, b);
}

/// Scenario 3: queue overflow drops the oldest, surviving exactly the last
/// `capacity` seqnos.
#[test]
fn scenario_queue_overflow_drops_oldest() {
    let (engine, _dev_id) = engine_with_nop_at("/dev/nop2");
    let (cb, seen) = counting_callback();
    let ctx = engine
        .context_alloc(ContextRequest {
            queue_len: 3,
            callback: Some(cb),
            data_rq: vec![(nop::ACCEL_ID, 0)],
        })
        .unwrap();
    ctx.start().unwrap();

    ctx.next(7).unwrap();
    std::thread::sleep(Duration::from_millis(150));
    let read = ctx.read_all_nowait();

    assert_eq!(read, 3);
    let mut seqnos = seen.lock().unwrap().clone();
    seqnos.sort_unstable();
    assert_eq!(seqnos, vec![4, 5, 6]);
}

/// Scenario 4: a second context subscribes to the same data id while the
/// first is actively receiving. From the instant `alloc` returns, both
/// contexts receive every subsequent record, and the second never sees a
/// record the first didn't also see.
#[test]
fn scenario_mid_flight_add() {
    let (engine, _dev_id) = engine_with_nop_at("/dev/nop-midflight");

    let (cb_a, seen_a) = counting_callback();
    let ctx_a = engine
        .context_alloc(ContextRequest {
            queue_len: 20,
            callback: Some(cb_a),
            data_rq: vec![(nop::ACCEL_ID, 0)],
        })
        .unwrap();
    ctx_a.start().unwrap();

    ctx_a.next(3).unwrap();
    std::thread::sleep(Duration::from_millis(100));
    ctx_a.read_all_nowait();

    let (cb_b, seen_b) = counting_callback();
    let ctx_b = engine
        .context_alloc(ContextRequest {
            queue_len: 20,
            callback: Some(cb_b),
            data_rq: vec![(nop::ACCEL_ID, 0)],
        })
        .unwrap();
    ctx_b.start().unwrap();

    ctx_a.next(4).unwrap();
    std::thread::sleep(Duration::from_millis(100));
    ctx_a.read_all_nowait();
    ctx_b.read_all_nowait();

    let a = seen_a.lock().unwrap().clone();
    let b = seen_b.lock().unwrap().clone();
    assert_eq!(a, vec![0, 1, 2, 3, 4, 5, 6]);
    assert_eq!(b, vec![3, 4, 5, 6]);
}

/// Scenario 5: two drivers whose schemas both claim the same data id
/// conflict; context_alloc refuses with ConflictingDrivers.
#[test]
fn scenario_conflicting_drivers() {
    let engine = Engine::new();
    engine
        .register("nop", Box::new(|| Box::new(NopDriver::new()) as Box<dyn DriverOps>))
        .unwrap();
    engine
        .init_driver_with_schema("nop", "/dev/nopA", &[], nop::schema_descs())
        .unwrap();
    engine
        .init_driver_with_schema("nop", "/dev/nopB", &[], nop::schema_descs())
        .unwrap();

    let (cb, _seen) = counting_callback();
    let err = engine
        .context_alloc(ContextRequest {
            queue_len: 4,
            callback: Some(cb),
            data_rq: vec![(nop::ACCEL_ID, 0)],
        })
        .unwrap_err();
    assert!(matches!(err, HoundError::ConflictingDrivers(_)));
}

/// Scenario 6: a period outside the driver's declared avail_periods is
/// refused, and no subscription state is left behind.
#[test]
fn scenario_period_unsupported_leaks_no_state() {
    let (engine, _dev_id) = engine_with_nop_at("/dev/nop3");
    let (cb, _seen) = counting_callback();
    let err = engine
        .context_alloc(ContextRequest {
            queue_len: 4,
            callback: Some(cb),
            data_rq: vec![(nop::ACCEL_ID, 123_456)],
        })
        .unwrap_err();
    assert!(matches!(err, HoundError::PeriodUnsupported { .. }));

    engine.destroy_driver("/dev/nop3").unwrap();
}

/// Partial-rollback: the second entry in a multi-id request fails, so the
/// first entry's ref must be undone too.
#[test]
fn scenario_alloc_rolls_back_partial_refs() {
    let (engine, _dev_id) = engine_with_nop_at("/dev/nop4");
    let (cb, _seen) = counting_callback();
    let err = engine
        .context_alloc(ContextRequest {
            queue_len: 4,
            callback: Some(cb),
            data_rq: vec![(nop::ACCEL_ID, 0), (nop::GYRO_ID, 999)],
        })
        .unwrap_err();
    assert!(matches!(err, HoundError::PeriodUnsupported { .. }));

    // Accel's ref must have been undone, or this destroy would fail with
    // DriverInUse.
    engine.destroy_driver("/dev/nop4").unwrap();
}

#[test]
fn context_alloc_rejects_empty_request() {
    let (engine, _dev_id) = engine_with_nop_at("/dev/nop5");
    let (cb, _seen) = counting_callback();
    let err = engine
        .context_alloc(ContextRequest {
            queue_len: 4,
            callback: Some(cb),
            data_rq: vec![],
        })
        .unwrap_err();
    assert!(matches!(err, HoundError::NoDataRequested));
}

#[test]
fn context_alloc_rejects_duplicate_data_id() {
    let (engine, _dev_id) = engine_with_nop_at("/dev/nop6");
    let (cb, _seen) = counting_callback();
    let err = engine
        .context_alloc(ContextRequest {
            queue_len: 4,
            callback: Some(cb),
            data_rq: vec![(nop::ACCEL_ID, 0), (nop::ACCEL_ID, 0)],
        })
        .unwrap_err();
    assert!(matches!(err, HoundError::DuplicateDataRequested(_)));
}

#[test]
fn context_double_start_and_stop_fail() {
    let (engine, _dev_id) = engine_with_nop_at("/dev/nop7");
    let (cb, _seen) = counting_callback();
    let ctx = engine
        .context_alloc(ContextRequest {
            queue_len: 4,
            callback: Some(cb),
            data_rq: vec![(nop::ACCEL_ID, 0)],
        })
        .unwrap();

    // Inactive right after alloc: the queue isn't subscribed until start().
    ctx.start().unwrap();
    assert!(matches!(ctx.start().unwrap_err(), HoundError::ContextActive));
    ctx.stop().unwrap();
    assert!(matches!(ctx.stop().unwrap_err(), HoundError::ContextNotActive));
    ctx.start().unwrap();
}

#[test]
fn stopped_context_receives_nothing_until_restarted() {
    let (engine, _dev_id) = engine_with_nop_at("/dev/nop8");
    let (cb, seen) = counting_callback();
    let ctx = engine
        .context_alloc(ContextRequest {
            queue_len: 8,
            callback: Some(cb),
            data_rq: vec![(nop::ACCEL_ID, 0)],
        })
        .unwrap();

    // Inactive right after alloc: the queue isn't subscribed yet.
    ctx.next(3).unwrap();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(ctx.read_all_nowait(), 0);
    assert!(seen.lock().unwrap().is_empty());

    ctx.start().unwrap();
    ctx.next(2).unwrap();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(ctx.read_all_nowait(), 2);
}

#[test]
fn get_datadesc_enumerates_enabled_entries() {
    let (engine, _dev_id) = engine_with_nop_at("/dev/nop9");
    let descs = engine.get_datadesc();
    let ids: Vec<DataId> = descs.iter().map(|d| d.data_id).collect();
    assert!(ids.contains(&nop::ACCEL_ID));
    assert!(ids.contains(&nop::GYRO_ID));
    assert!(descs.iter().all(|d| !d.name.is_empty()));
}

/// Atomic init: a schema with a duplicate data id across two entries of the
/// same driver instance fails `init_driver`, and leaves no instance behind
/// for `destroy_driver` to find.
#[test]
fn atomic_init_failure_leaves_no_instance() {
    let engine = Engine::new();
    engine
        .register("nop", Box::new(|| Box::new(NopDriver::new()) as Box<dyn DriverOps>))
        .unwrap();

    let mut schema = nop::schema_descs();
    schema.push(schema[0].clone());
    let err = engine
        .init_driver_with_schema("nop", "/dev/nop-init-fail", &[], schema)
        .unwrap_err();
    assert!(matches!(err, HoundError::DescriptorDuplicate(_)));

    let destroy_err = engine.destroy_driver("/dev/nop-init-fail").unwrap_err();
    assert!(matches!(destroy_err, HoundError::DriverNotRegistered(_)));
}
