//! Unit tests for the typed client.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use portlink_protocol::ErrorCode;
use rstest::{fixture, rstest};
use serde::Deserialize;
use serde_json::{Value, json};

use super::*;
use crate::channel::Port;
use crate::test_support::{FrameLog, wait_until};

#[derive(Debug, Deserialize, PartialEq)]
struct Echo {
    payload: String,
}

/// Answers each request with the frames produced by `script`.
fn scripted_remote(
    remote: &Port,
    script: impl Fn(&Value) -> Vec<Value> + Send + Sync + 'static,
) -> FrameLog {
    let responder = remote.clone();
    let log = FrameLog::attach(remote);
    remote.add_message_listener(Arc::new(move |message| {
        let Some(request) = message.get("trpc") else {
            return;
        };
        for body in script(request) {
            let mut frame = body;
            frame["id"] = request["id"].clone();
            responder.post(json!({ "trpc": frame })).expect("post response");
        }
    }));
    log
}

fn client_with(
    script: impl Fn(&Value) -> Vec<Value> + Send + Sync + 'static,
) -> (Client<Port>, FrameLog) {
    let (local, remote) = Port::pair("client-tests", None);
    let log = scripted_remote(&remote, script);
    // The remote end stays alive through the responder captured by its own
    // listener.
    let client = Client::with_timeout(Link::new(local), Duration::from_millis(200));
    (client, log)
}

#[fixture]
fn echo_client() -> (Client<Port>, FrameLog) {
    client_with(|request| {
        let input = request["params"]["input"].clone();
        vec![json!({"result": {"type": "data", "data": input}})]
    })
}

#[rstest]
fn query_decodes_typed_output(echo_client: (Client<Port>, FrameLog)) {
    let (client, _log) = echo_client;

    let echo: Echo = client
        .query("greeting.echo", &json!({"payload": "x"}))
        .expect("query succeeds");

    assert_eq!(echo, Echo { payload: "x".into() });
}

#[rstest]
fn unit_input_is_omitted_from_the_frame(echo_client: (Client<Port>, FrameLog)) {
    let (client, log) = echo_client;

    let output: Option<u8> = client.mutation("counter.reset", &()).expect("mutation");

    assert_eq!(output, None);
    let frames = log.wait_for(1);
    assert!(frames[0]["trpc"]["params"].get("input").is_none());
    assert_eq!(frames[0]["trpc"]["method"], json!("mutation"));
}

#[test]
fn remote_errors_surface_with_their_code() {
    let (client, _log) = client_with(|_| {
        vec![json!({"error": {
            "message": "divide by zero",
            "code": -32_600,
            "data": {"code": "BAD_REQUEST", "httpStatus": 400, "path": "math.divide"}
        }})]
    });

    let error = client
        .query::<_, f64>("math.divide", &json!({"a": 1, "b": 0}))
        .expect_err("remote failure");

    assert_eq!(error.code(), ErrorCode::BadRequest);
    assert_eq!(error.to_string(), "divide by zero");
}

#[test]
fn silent_callee_times_out_and_clears_the_call() {
    let (client, _log) = client_with(|_| Vec::new());

    let error = client.query::<_, Value>("slow", &()).expect_err("no answer");

    assert!(matches!(error, ClientError::Timeout { ref path, timeout_ms: 200 } if path == "slow"));
    assert_eq!(client.link().pending_calls(), 0);
}

#[test]
fn lifecycle_marker_for_a_query_is_unexpected() {
    let (client, _log) = client_with(|_| vec![json!({"result": {"type": "started"}})]);

    let error = client.query::<_, Value>("clock.ticks", &()).expect_err("not data");

    assert!(matches!(
        error,
        ClientError::UnexpectedResult { kind: ResultKind::Started, .. }
    ));
}

#[test]
fn mismatched_output_type_is_a_decode_error() {
    let (client, _log) = client_with(|_| vec![json!({"result": {"data": "text"}})]);

    let error = client.query::<_, u32>("a", &()).expect_err("wrong type");

    assert!(matches!(error, ClientError::Decode { .. }));
}

#[test]
fn subscription_callbacks_follow_the_stream() {
    let (client, _log) = client_with(|request| {
        if request["method"] != json!("subscription") {
            return Vec::new();
        }
        vec![
            json!({"result": {"type": "started"}}),
            json!({"result": {"type": "data", "data": 1}}),
            json!({"result": {"type": "data", "data": 2}}),
            json!({"result": {"type": "stopped"}}),
        ]
    });
    let events = Arc::new(Mutex::new(Vec::new()));
    let (started, data, done) = (Arc::clone(&events), Arc::clone(&events), Arc::clone(&events));

    let _handle = client
        .subscription(
            "clock.ticks",
            &(),
            SubscriptionCallbacks::new(move |tick: u32| {
                data.lock().expect("lock").push(format!("data {tick}"));
            })
            .on_started(move || started.lock().expect("lock").push("started".to_owned()))
            .on_complete(move || done.lock().expect("lock").push("complete".to_owned())),
        )
        .expect("subscribe");

    assert!(wait_until(|| events.lock().expect("lock").len() == 4));
    assert_eq!(
        *events.lock().expect("lock"),
        vec!["started", "data 1", "data 2", "complete"]
    );
}

#[test]
fn undecodable_value_ends_the_subscription() {
    let (client, log) = client_with(|request| {
        if request["method"] != json!("subscription") {
            return Vec::new();
        }
        vec![
            json!({"result": {"type": "started"}}),
            json!({"result": {"data": "not a number"}}),
            json!({"result": {"data": 7}}),
            json!({"result": {"type": "stopped"}}),
        ]
    });
    let events = Arc::new(Mutex::new(Vec::new()));
    let (started, data, failed, done) = (
        Arc::clone(&events),
        Arc::clone(&events),
        Arc::clone(&events),
        Arc::clone(&events),
    );

    let handle = client
        .subscription(
            "clock.ticks",
            &(),
            SubscriptionCallbacks::new(move |tick: u64| {
                data.lock().expect("lock").push(format!("data {tick}"));
            })
            .on_started(move || started.lock().expect("lock").push("started".to_owned()))
            .on_error(move |error| {
                let kind = if matches!(error, ClientError::Decode { .. }) {
                    "decode"
                } else {
                    "other"
                };
                failed.lock().expect("lock").push(format!("error {kind}"));
            })
            .on_complete(move || done.lock().expect("lock").push("complete".to_owned())),
        )
        .expect("subscribe");

    let stop = json!({"trpc": {"id": handle.id().clone(), "method": "subscription.stop"}});
    assert!(wait_until(|| log.snapshot().contains(&stop)));
    assert_eq!(client.link().pending_calls(), 0);
    assert_eq!(*events.lock().expect("lock"), vec!["started", "error decode"]);
}
