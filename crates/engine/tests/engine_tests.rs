use std::{cell::RefCell, rc::Rc};

use serde_json::json;
use spytrace_common::logging::ensure_test_logging;
use spytrace_engine::{
    fields, hook, trace_call, trace_line, trace_return, EventKind, Fallback, FieldMask, FrameId,
    RawEvent, TraceEngine, TraceError, TraceHook, Tracer,
};
use tracing::info;

#[derive(Debug)]
struct Connection {
    #[allow(dead_code)]
    port: u16,
}

#[rustfmt::skip]
fn inner(x: u64) -> u64 {
    let frame = trace_call!("inner"; x);
    trace_line!(frame; x); let y = x + 1;
    trace_return!(frame, y; x, y);
    y
}

#[rustfmt::skip]
fn outer() -> u64 {
    let frame = trace_call!("outer");
    trace_line!(frame); let total = inner(1) + inner(2);
    trace_return!(frame, total; total);
    total
}

#[rustfmt::skip]
fn with_connection() -> u16 {
    let frame = trace_call!("with_connection");
    trace_line!(frame); let connection = Connection { port: 8080 };
    trace_line!(frame; ?connection); let port = 1;
    trace_return!(frame, port; port);
    port
}

/// Records the kinds of all events it sees
fn counting_hook() -> (Rc<dyn TraceHook>, Rc<RefCell<Vec<EventKind>>>) {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    let hook: Rc<dyn TraceHook> =
        Rc::new(move |event: &RawEvent<'_>| sink.borrow_mut().push(event.kind));
    (hook, seen)
}

#[test]
fn test_stop_restores_displaced_hook() {
    ensure_test_logging(None);
    info!("Running test");
    let (previous, seen) = counting_hook();
    hook::replace(Some(previous.clone()));

    let mut engine = TraceEngine::new(FieldMask::default(), Fallback::default());
    engine.start();
    assert!(engine.is_active());
    outer();
    engine.stop();

    let current = hook::current().unwrap();
    assert!(Rc::ptr_eq(&current, &previous));
    // without cooperation the displaced hook sees nothing while the engine runs
    assert!(seen.borrow().is_empty());
    assert_eq!(engine.len(), 9);

    hook::replace(None);
}

#[test]
fn test_cooperation_forwards_every_event() {
    ensure_test_logging(None);
    info!("Running test");
    let (previous, seen) = counting_hook();
    hook::replace(Some(previous.clone()));

    let mut engine =
        TraceEngine::new(FieldMask::default(), Fallback::default()).with_cooperation(true);
    engine.start();
    outer();
    engine.stop();

    assert_eq!(seen.borrow().len(), engine.len());
    assert_eq!(seen.borrow().first(), Some(&EventKind::Call));
    assert!(Rc::ptr_eq(&hook::current().unwrap(), &previous));

    hook::replace(None);
}

#[test]
fn test_nested_engines_restore_in_order() {
    ensure_test_logging(None);
    info!("Running test");
    let mut first = TraceEngine::new(FieldMask::default(), Fallback::default());
    let mut second = TraceEngine::new(FieldMask::default(), Fallback::default());

    first.start();
    second.start();
    inner(1);
    second.stop();
    inner(2);
    first.stop();

    assert!(!hook::is_installed());
    assert_eq!(second.len(), 3);
    assert_eq!(first.len(), 3);
    assert_eq!(first.events()[0].locals.as_ref().unwrap()["x"], json!(2));
}

#[test]
fn test_engines_stopped_out_of_order() {
    ensure_test_logging(None);
    info!("Running test");
    let (previous, seen) = counting_hook();
    hook::replace(Some(previous.clone()));

    let mut first =
        TraceEngine::new(FieldMask::default(), Fallback::default()).with_cooperation(true);
    let mut second =
        TraceEngine::new(FieldMask::default(), Fallback::default()).with_cooperation(true);
    first.start();
    second.start();
    inner(1);
    first.stop();
    assert!(!first.is_active() && second.is_active());

    // the stopped engine is unlinked, the other one now forwards past it
    inner(2);
    second.stop();
    assert!(Rc::ptr_eq(&hook::current().unwrap(), &previous));

    inner(3);
    assert_eq!(first.len(), 3);
    assert_eq!(second.len(), 6);
    assert_eq!(seen.borrow().len(), 9);

    hook::replace(None);
}

#[test]
fn test_dropping_active_engine_restores_hook() {
    ensure_test_logging(None);
    info!("Running test");
    {
        let mut engine = TraceEngine::new(FieldMask::default(), Fallback::default());
        engine.start();
        assert!(hook::is_installed());
    }
    assert!(!hook::is_installed());
}

#[test]
#[rustfmt::skip]
fn test_stop_cuts_off_teardown_events() {
    ensure_test_logging(None);
    info!("Running test");
    let mut engine = TraceEngine::new(FieldMask::all(), Fallback::default());
    engine.start();
    inner(1);
    let frame = trace_call!("teardown"); engine.stop();
    drop(frame);

    let events = engine.events();
    assert_eq!(events.len(), 3);
    assert!(events.iter().all(|event| event.function.as_deref() == Some("inner")));
}

#[test]
fn test_frame_identity_and_parents() {
    ensure_test_logging(None);
    info!("Running test");
    let mask = FieldMask::default().with(fields::FRAME_ID).with(fields::FRAME_BACK);
    let mut tracer = Tracer::new(mask, Fallback::default()).unwrap();
    tracer.trace_infallible(outer).unwrap();

    let events = tracer.events();
    let calls: Vec<_> =
        events.iter().filter(|event| event.event == Some(EventKind::Call)).collect();
    assert_eq!(calls.len(), 3);

    let outer_id = calls[0].frame_id.unwrap();
    assert_eq!(calls[0].parent_frame_id, None);
    assert_eq!(calls[1].parent_frame_id, Some(outer_id));
    assert_eq!(calls[2].parent_frame_id, Some(outer_id));
    assert_ne!(calls[1].frame_id, calls[2].frame_id);

    // every event of a frame carries the same id
    let inner_ids: Vec<FrameId> = events
        .iter()
        .filter(|event| event.frame_id != Some(outer_id))
        .map(|event| event.frame_id.unwrap())
        .collect();
    assert_eq!(inner_ids.len(), 6);
}

#[test]
fn test_unselected_fields_are_absent() {
    ensure_test_logging(None);
    info!("Running test");
    let mut tracer = Tracer::default();
    tracer.trace_infallible(outer).unwrap();

    for event in tracer.events().iter() {
        assert!(event.function.is_none());
        assert!(event.frame_id.is_none());
        assert!(event.parent_frame_id.is_none());
        assert!(event.globals.is_none());
        assert!(event.locals.is_some());
    }
}

#[test]
fn test_captured_values_are_snapshots() {
    ensure_test_logging(None);
    info!("Running test");

    #[rustfmt::skip]
    fn mutate() -> usize {
        let frame = trace_call!("mutate");
        trace_line!(frame); let mut values = vec![1];
        trace_line!(frame; values); values.push(2);
        trace_line!(frame; values); let len = values.len();
        trace_return!(frame, len; values, len);
        len
    }

    let mut tracer = Tracer::default();
    tracer.trace_infallible(mutate).unwrap();
    let snapshots = tracer.snapshots().unwrap();
    assert_eq!(snapshots[1].locals.as_ref().unwrap()["values"], json!([1]));
    assert_eq!(snapshots[2].locals.as_ref().unwrap()["values"], json!([1, 2]));
}

#[test]
fn test_opaque_values_use_fallback() {
    ensure_test_logging(None);
    info!("Running test");

    let mut tracer = Tracer::new(FieldMask::default(), Fallback::Repr).unwrap();
    tracer.trace_infallible(with_connection).unwrap();
    let snapshots = tracer.snapshots().unwrap();
    let connection = &snapshots[1].locals.as_ref().unwrap()["connection"];
    assert_eq!(connection, &json!("Connection { port: 8080 }"));

    let mut tracer = Tracer::new(FieldMask::default(), Fallback::TypeName).unwrap();
    tracer.trace_infallible(with_connection).unwrap();
    let snapshots = tracer.snapshots().unwrap();
    let marker = snapshots[1].locals.as_ref().unwrap()["connection"].to_string();
    assert!(marker.starts_with("\"<unserializable ") && marker.ends_with("Connection>\""));

    let mut tracer =
        Tracer::new(FieldMask::default(), Fallback::constant("<opaque>")).unwrap();
    tracer.trace_infallible(with_connection).unwrap();
    let snapshots = tracer.snapshots().unwrap();
    assert_eq!(snapshots[1].locals.as_ref().unwrap()["connection"], json!("<opaque>"));

    let transform = Fallback::transform(|rejected| json!({ "opaque": rejected.name() }));
    let mut tracer = Tracer::new(FieldMask::default(), transform).unwrap();
    tracer.trace_infallible(with_connection).unwrap();
    let snapshots = tracer.snapshots().unwrap();
    assert_eq!(
        snapshots[1].locals.as_ref().unwrap()["connection"],
        json!({ "opaque": "connection" })
    );
}

#[test]
fn test_strict_fallback_reports_serialization_error() {
    ensure_test_logging(None);
    info!("Running test");
    let mut tracer = Tracer::new(FieldMask::default(), Fallback::Error).unwrap();

    match tracer.trace_infallible(with_connection) {
        Err(TraceError::Serialization(err)) => assert_eq!(err.name, "connection"),
        other => panic!("expected a serialization error, got {other:?}"),
    }
    assert!(!tracer.is_tracing());

    // the event that failed is dropped, the others are kept
    let lines = tracer.snapshots().unwrap();
    assert_eq!(lines.len(), 1);
    assert_eq!(tracer.events().len(), 3);
}

#[test]
fn test_ignored_user_files() {
    ensure_test_logging(None);
    info!("Running test");
    let mut engine = TraceEngine::new(FieldMask::default(), Fallback::default());
    engine.ignore_file(file!());
    assert!(engine.ignored_files().contains(&file!().to_string()));

    engine.start();
    outer();
    engine.stop();
    assert!(engine.is_empty());
}
