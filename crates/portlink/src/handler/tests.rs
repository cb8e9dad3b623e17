//! Unit tests for the callee-side dispatcher, driven with raw frames.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use mockall::mock;
use portlink_protocol::{CallKind, ErrorCode};
use rstest::{fixture, rstest};
use serde::Deserialize;
use serde_json::{Value, json};

use super::*;
use crate::channel::{Channel, Port, PortHub};
use crate::observable::Observable;
use crate::router::Router;
use crate::test_support::{Feed, FrameLog, wait_until};

mock! {
    Reporter {}
    impl ErrorReporter for Reporter {
        fn report(&self, details: &ErrorDetails);
    }
}

struct Ctx {
    port: String,
}

#[derive(Deserialize)]
struct Division {
    a: f64,
    b: f64,
}

fn router(feed: &Feed) -> Router<Ctx> {
    let feed = feed.clone();
    let greeting = Router::new()
        .query("echo", |_ctx: &Ctx, input: Value| Ok(input))
        .query("whoami", |ctx: &Ctx, (): ()| Ok(ctx.port.clone()));
    let math = Router::new().mutation("divide", |_ctx: &Ctx, input: Division| {
        if input.b == 0.0 {
            return Err(ProcedureError::bad_request("division by zero"));
        }
        Ok(input.a / input.b)
    });
    let streams = Router::new()
        .subscription("feed", move |_ctx: &Ctx, (): ()| Ok(feed.observable()))
        .subscription("count", |_ctx: &Ctx, to: u32| {
            Ok(Observable::from_values(1..=to))
        })
        .subscription("broken", |_ctx: &Ctx, (): ()| {
            Ok(Observable::<u32, _>::fail(ProcedureError::internal("stream broke")))
        });
    let faults = Router::new().query("panic", |_ctx: &Ctx, (): ()| -> Result<u8, ProcedureError> {
        panic!("boom")
    });
    Router::new()
        .merge("greeting", greeting)
        .merge("math", math)
        .merge("streams", streams)
        .merge("faults", faults)
}

fn options(feed: &Feed) -> HandlerOptions<Ctx> {
    HandlerOptions::new(router(feed), |info: &ChannelInfo| {
        Ok(Ctx {
            port: info.name().to_owned(),
        })
    })
}

struct Served {
    caller: Port,
    frames: FrameLog,
    connection: ConnectionHandle,
    feed: Feed,
}

impl Served {
    fn with(feed: Feed, options: HandlerOptions<Ctx>) -> Self {
        let (caller, callee) = Port::pair("handler-tests", Some("ext://tests".into()));
        let frames = FrameLog::attach(&caller);
        let connection = Handler::new(options)
            .attach_channel(callee)
            .expect("channel accepted");
        Self {
            caller,
            frames,
            connection,
            feed,
        }
    }

    fn send(&self, frame: Value) {
        self.caller.post(json!({ "trpc": frame })).expect("post request");
    }

    /// Sends a query with id `"marker"` and waits for its answer, proving
    /// every earlier message has been handled.
    fn settle(&self) -> Vec<Value> {
        self.send(json!({"id": "marker", "method": "query", "params": {"path": "greeting.echo"}}));
        assert!(wait_until(|| self
            .frames
            .snapshot()
            .iter()
            .any(|frame| frame["trpc"]["id"] == json!("marker"))));
        self.frames
            .snapshot()
            .into_iter()
            .filter(|frame| frame["trpc"]["id"] != json!("marker"))
            .collect()
    }
}

#[fixture]
fn served() -> Served {
    let feed = Feed::default();
    let options = options(&feed);
    Served::with(feed, options)
}

fn subscribe(id: i64, path: &str) -> Value {
    json!({"id": id, "method": "subscription", "params": {"path": path}})
}

fn result(id: i64, body: Value) -> Value {
    json!({"trpc": {"id": id, "result": body}})
}

#[rstest]
fn echo_query_answers_once(served: Served) {
    served.send(json!({
        "id": 1,
        "method": "query",
        "params": {"path": "greeting.echo", "input": {"payload": "x"}}
    }));

    assert_eq!(
        served.settle(),
        vec![result(1, json!({"type": "data", "data": {"payload": "x"}}))]
    );
}

#[rstest]
fn context_is_built_from_the_channel(served: Served) {
    served.send(json!({"id": 1, "method": "query", "params": {"path": "greeting.whoami"}}));

    assert_eq!(
        served.settle(),
        vec![result(1, json!({"type": "data", "data": "handler-tests"}))]
    );
}

#[rstest]
#[case::unknown_leaf("greeting.nope")]
#[case::router_path("greeting")]
fn unknown_path_is_not_found(served: Served, #[case] path: &str) {
    served.send(json!({"id": 2, "method": "query", "params": {"path": path}}));

    let frames = served.settle();
    let error = &frames[0]["trpc"]["error"];
    assert_eq!(error["data"]["code"], json!("NOT_FOUND"));
    assert_eq!(error["data"]["httpStatus"], json!(404));
    assert_eq!(error["data"]["path"], json!(path));
    assert_eq!(
        error["message"],
        json!(format!("No procedure found on path \"{path}\""))
    );
}

#[rstest]
fn missing_params_is_a_bad_request(served: Served) {
    served.send(json!({"id": 3, "method": "mutation"}));

    let frames = served.settle();
    assert_eq!(frames[0]["trpc"]["error"]["message"], json!("missing params"));
    assert_eq!(frames[0]["trpc"]["error"]["data"]["code"], json!("BAD_REQUEST"));
}

#[rstest]
fn unknown_method_is_a_parse_error(served: Served) {
    served.send(json!({"id": 4, "method": "teleport", "params": {"path": "greeting.echo"}}));

    let frames = served.settle();
    assert_eq!(frames[0]["trpc"]["error"]["data"]["code"], json!("PARSE_ERROR"));
    assert_eq!(frames[0]["trpc"]["error"]["code"], json!(-32_700));
}

#[rstest]
fn foreign_traffic_and_responses_are_ignored(served: Served) {
    served.caller.post(json!({"hello": "world"})).expect("post");
    served.send(json!({"id": null, "method": "query", "params": {"path": "greeting.echo"}}));
    served.send(json!({"id": 5, "result": {"type": "data", "data": 1}}));

    assert!(served.settle().is_empty());
}

#[rstest]
fn stop_for_unknown_id_writes_nothing(served: Served) {
    served.send(json!({"id": 9, "method": "subscription.stop"}));
    served.send(json!({"id": 9, "method": "subscription.stop"}));

    assert!(served.settle().is_empty());
}

#[rstest]
fn panicking_procedure_becomes_internal_error(served: Served) {
    served.send(json!({"id": 6, "method": "query", "params": {"path": "faults.panic"}}));

    let frames = served.settle();
    assert_eq!(
        frames[0]["trpc"]["error"]["data"]["code"],
        json!("INTERNAL_SERVER_ERROR")
    );
    assert_eq!(
        frames[0]["trpc"]["error"]["message"],
        json!("procedure panicked: boom")
    );
}

#[rstest]
fn subscription_lifecycle_ends_with_stopped(served: Served) {
    served.send(subscribe(7, "streams.feed"));
    let observer = served.feed.observer();
    observer.next(1);
    observer.next(2);
    assert!(wait_until(|| served.frames.len() == 3));
    assert_eq!(served.connection.active_subscriptions(), 1);

    served.send(json!({"id": 7, "method": "subscription.stop"}));
    let frames = served.settle();

    assert_eq!(
        frames,
        vec![
            result(7, json!({"type": "started"})),
            result(7, json!({"type": "data", "data": 1})),
            result(7, json!({"type": "data", "data": 2})),
            result(7, json!({"type": "stopped"})),
        ]
    );
    assert_eq!(served.connection.active_subscriptions(), 0);
    assert_eq!(served.feed.teardowns(), 1);
    assert!(observer.is_closed());
}

#[rstest]
fn stop_tears_the_producer_down_before_writing_stopped(served: Served) {
    let teardowns_at_stopped = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&teardowns_at_stopped);
    let feed = served.feed.clone();
    served.caller.add_message_listener(Arc::new(move |message: &Value| {
        if message["trpc"]["result"]["type"] == json!("stopped") {
            *seen.lock().expect("lock") = Some(feed.teardowns());
        }
    }));
    served.send(subscribe(13, "streams.feed"));
    let _observer = served.feed.observer();

    served.send(json!({"id": 13, "method": "subscription.stop"}));
    served.settle();

    assert_eq!(*teardowns_at_stopped.lock().expect("lock"), Some(1));
    assert_eq!(served.connection.active_subscriptions(), 0);
}

#[rstest]
fn synchronous_stream_waits_for_started(served: Served) {
    served.send(json!({
        "id": 8,
        "method": "subscription",
        "params": {"path": "streams.count", "input": 2}
    }));

    assert_eq!(
        served.settle(),
        vec![
            result(8, json!({"type": "started"})),
            result(8, json!({"type": "data", "data": 1})),
            result(8, json!({"type": "data", "data": 2})),
            result(8, json!({"type": "stopped"})),
        ]
    );
    assert_eq!(served.connection.active_subscriptions(), 0);
}

#[rstest]
fn duplicate_subscription_id_stops_old_and_rejects_new(served: Served) {
    served.send(subscribe(10, "streams.feed"));
    let first = served.feed.observer();

    served.send(subscribe(10, "streams.feed"));
    let frames = served.settle();

    assert_eq!(frames.len(), 3);
    assert_eq!(frames[0], result(10, json!({"type": "started"})));
    assert_eq!(frames[1], result(10, json!({"type": "stopped"})));
    assert_eq!(frames[2]["trpc"]["error"]["message"], json!("duplicate id"));
    assert_eq!(frames[2]["trpc"]["error"]["data"]["code"], json!("BAD_REQUEST"));
    assert!(first.is_closed());
    assert_eq!(served.connection.active_subscriptions(), 0);
}

#[rstest]
fn stream_error_is_written_after_started(served: Served) {
    served.send(subscribe(11, "streams.broken"));

    let frames = served.settle();

    assert_eq!(frames[0], result(11, json!({"type": "started"})));
    assert_eq!(frames[1]["trpc"]["error"]["message"], json!("stream broke"));
    assert_eq!(frames.len(), 2);
    assert_eq!(served.connection.active_subscriptions(), 0);
}

#[rstest]
fn emissions_after_stop_are_dropped(served: Served) {
    served.send(subscribe(12, "streams.feed"));
    let observer = served.feed.observer();
    served.send(json!({"id": 12, "method": "subscription.stop"}));
    let before = served.settle().len();

    observer.next(99);
    observer.complete();

    assert_eq!(served.settle().len(), before);
}

#[rstest]
fn disconnect_unsubscribes_every_stream(served: Served) {
    served.send(subscribe(13, "streams.feed"));
    let observer = served.feed.observer();
    assert!(wait_until(|| served.connection.active_subscriptions() == 1));

    served.caller.disconnect();

    assert!(wait_until(|| served.feed.teardowns() == 1));
    assert!(served.connection.is_closed());
    assert_eq!(served.connection.active_subscriptions(), 0);
    assert!(observer.is_closed());
}

#[rstest]
fn closing_the_handle_disconnects_the_caller(served: Served) {
    served.connection.close();
    served.connection.close();

    assert!(served.connection.is_closed());
    assert!(wait_until(|| !served.caller.is_connected()));
}

#[test]
fn procedure_failure_is_reported_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let mut reporter = MockReporter::new();
    reporter
        .expect_report()
        .withf(|details| {
            details.path.as_deref() == Some("math.divide")
                && details.kind == Some(CallKind::Mutation)
                && details.error.code() == ErrorCode::BadRequest
                && details.input == Some(json!({"a": 1, "b": 0}))
                && details.channel.origin() == Some("ext://tests")
        })
        .returning(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    let feed = Feed::default();
    let served = Served::with(feed.clone(), options(&feed).on_error(reporter));

    served.send(json!({
        "id": 14,
        "method": "mutation",
        "params": {"path": "math.divide", "input": {"a": 1, "b": 0}}
    }));
    let frames = served.settle();

    assert_eq!(frames[0]["trpc"]["error"]["message"], json!("division by zero"));
    assert_eq!(frames[0]["trpc"]["error"]["code"], json!(-32_600));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn refused_channel_is_disconnected() {
    let feed = Feed::default();
    let handler = Handler::new(
        options(&feed).accept_channel(|info: &ChannelInfo| info.origin() == Some("ext://trusted")),
    );
    let (caller, callee) = Port::pair("untrusted", Some("https://elsewhere".into()));

    assert!(handler.attach_channel(callee).is_none());
    assert!(wait_until(|| !caller.is_connected()));
}

#[test]
fn attach_serves_every_hub_connection() {
    let hub = PortHub::new();
    let feed = Feed::default();
    Handler::new(options(&feed)).attach(&hub);

    let callers: Vec<Port> = (0..2).map(|n| hub.connect(format!("tab-{n}"), None)).collect();
    let logs: Vec<FrameLog> = callers.iter().map(FrameLog::attach).collect();
    for caller in &callers {
        caller
            .post(json!({"trpc": {"id": 1, "method": "query", "params": {"path": "greeting.whoami"}}}))
            .expect("post");
    }

    for (n, log) in logs.iter().enumerate() {
        assert_eq!(
            log.wait_for(1),
            vec![result(1, json!({"type": "data", "data": format!("tab-{n}")}))]
        );
    }
}
