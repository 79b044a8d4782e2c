//! End-to-end conformance: one in-process broker, one agent, one or more
//! remotes, exercising the documented scenarios.

use std::time::Duration;

use serde_json::json;
use test_support::{connect_remote, connect_remote_with_timeout, start_agent, AGENT, DOMAIN};
use tokio::sync::mpsc;
use vrpc_broker::MemoryBroker;
use vrpc_core::{AgentStatus, VrpcError};
use vrpc_remote::{CallArg, CallRequest, CreateRequest, DeleteRequest, InstanceRequest, RemoteEvent};

fn static_call(function: &str, args: Vec<CallArg>) -> CallRequest {
    CallRequest {
        class_name: "Foo".into(),
        function_name: function.into(),
        args,
        ..CallRequest::default()
    }
}

#[tokio::test]
async fn static_greet_round_trips() {
    let broker = MemoryBroker::new();
    let agent = start_agent(&broker);
    let remote = connect_remote(&broker).await;

    let out = remote
        .call_static(static_call("greet", vec![CallArg::value(json!("bob"))]))
        .await
        .expect("greet");
    assert_eq!(out, json!("hi bob"));

    remote.end().await.expect("end");
    agent.stop().expect("stop");
}

#[tokio::test]
async fn instance_lifecycle_create_call_delete() {
    let broker = MemoryBroker::new();
    let agent = start_agent(&broker);
    let remote = connect_remote(&broker).await;

    let proxy = remote
        .create(CreateRequest {
            instance: Some("c1".into()),
            args: vec![CallArg::value(json!(0))],
            ..CreateRequest::new("Counter")
        })
        .await
        .expect("create");
    assert_eq!(proxy.call("increment", vec![]).await.expect("first"), json!(1));
    assert_eq!(proxy.call("increment", vec![]).await.expect("second"), json!(2));

    // Creation republished the class info, so the instance is discoverable.
    assert_eq!(remote.available_instances(DOMAIN, AGENT, "Counter").await, vec!["c1"]);

    let deleted = remote
        .delete(DeleteRequest {
            class_name: "Counter".into(),
            instance: "c1".into(),
            ..DeleteRequest::default()
        })
        .await
        .expect("delete");
    assert!(deleted);

    let err = proxy.call("increment", vec![]).await.expect_err("deleted instance");
    assert_eq!(
        err,
        VrpcError::Remote("remote function call failed: Instance c1 does not exist".into())
    );

    remote.end().await.expect("end");
    agent.stop().expect("stop");
}

#[tokio::test]
async fn one_shot_callback_delivers_once() {
    let broker = MemoryBroker::new();
    let agent = start_agent(&broker);
    let remote = connect_remote(&broker).await;

    let proxy = remote
        .create(CreateRequest { instance: Some("c1".into()), ..CreateRequest::new("Counter") })
        .await
        .expect("create");

    let (tx, mut rx) = mpsc::unbounded_channel();
    proxy
        .call(
            "compute",
            vec![
                CallArg::value(json!("job")),
                CallArg::callback(move |args| {
                    let _ = tx.send(args);
                }),
            ],
        )
        .await
        .expect("compute");

    // The agent invoked the callable twice; the one-shot sink was removed
    // after the first delivery.
    assert_eq!(rx.recv().await.expect("delivery"), vec![json!(42), json!("x")]);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());

    remote.end().await.expect("end");
    agent.stop().expect("stop");
}

#[tokio::test]
async fn repeated_on_registration_is_idempotent() {
    let broker = MemoryBroker::new();
    let agent = start_agent(&broker);
    let remote = connect_remote(&broker).await;

    let proxy = remote
        .create(CreateRequest { instance: Some("c1".into()), ..CreateRequest::new("Counter") })
        .await
        .expect("create");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let tx2 = tx.clone();
    proxy.on("data", move |args| {
        let _ = tx.send(args);
    })
    .await
    .expect("first registration");
    // Second identical registration: the agent answers "Repeated event
    // registration" and the remote swallows it.
    proxy.on("data", move |args| {
        let _ = tx2.send(args);
    })
    .await
    .expect("second registration");

    assert_eq!(proxy.call("feed", vec![CallArg::value(json!("v1"))]).await.expect("feed"), json!(1));
    assert_eq!(proxy.call("feed", vec![CallArg::value(json!("v2"))]).await.expect("feed"), json!(1));

    assert_eq!(rx.recv().await.expect("first emission"), vec![json!("v1")]);
    assert_eq!(rx.recv().await.expect("second emission"), vec![json!("v2")]);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err(), "each emission is delivered exactly once");

    remote.end().await.expect("end");
    agent.stop().expect("stop");
}

#[tokio::test]
async fn agent_loss_turns_presence_offline() {
    let broker = MemoryBroker::new();
    let agent = start_agent(&broker);
    let remote = connect_remote(&broker).await;
    let mut events = remote.events();

    assert_eq!(remote.agent_status(DOMAIN, AGENT).await, Some(AgentStatus::Online));
    agent.kill();

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("event within will delay")
        .expect("channel open");
    match event {
        RemoteEvent::Agent { agent, status, .. } => {
            assert_eq!(agent, AGENT);
            assert_eq!(status, AgentStatus::Offline);
        }
        other => panic!("expected agent event, got {other:?}"),
    }

    // The entry survives with offline status; its classes stay listed.
    assert_eq!(remote.available_agents(DOMAIN).await, vec![AGENT]);
    assert_eq!(remote.agent_status(DOMAIN, AGENT).await, Some(AgentStatus::Offline));
    assert_eq!(remote.available_classes(DOMAIN, AGENT).await, vec!["Counter", "Foo"]);

    remote.end().await.expect("end");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_call_times_out_and_late_reply_is_dropped() {
    let broker = MemoryBroker::new();
    let agent = start_agent(&broker);
    let remote = connect_remote_with_timeout(&broker, 100).await;

    let proxy = remote
        .create(CreateRequest { instance: Some("c1".into()), ..CreateRequest::new("Counter") })
        .await
        .expect("create");
    let err = proxy.call("sleepy", vec![]).await.expect_err("sleeps past the timeout");
    assert_eq!(err, VrpcError::Timeout(100));

    // Let the late reply arrive; it must be dropped silently and the
    // connection must stay usable.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let out = remote
        .call_static(static_call("greet", vec![CallArg::value(json!("bob"))]))
        .await
        .expect("connection still usable");
    assert_eq!(out, json!("hi bob"));

    remote.end().await.expect("end");
    agent.stop().expect("stop");
}

#[tokio::test]
async fn echo_round_trips_arbitrary_values() {
    let broker = MemoryBroker::new();
    let agent = start_agent(&broker);
    let remote = connect_remote(&broker).await;

    let value = json!({
        "nested": { "list": [1, 2.5, "three", null, true] },
        "empty": {},
    });
    let out = remote
        .call_static(static_call("echo", vec![CallArg::Value(value.clone())]))
        .await
        .expect("echo");
    assert_eq!(out, value);

    remote.end().await.expect("end");
    agent.stop().expect("stop");
}

#[tokio::test]
async fn promise_token_defers_the_actual_result() {
    let broker = MemoryBroker::new();
    let agent = start_agent(&broker);
    let remote = connect_remote(&broker).await;

    let out = remote.call_static(static_call("deferred", vec![])).await.expect("deferred");
    assert_eq!(out, json!(42));

    remote.end().await.expect("end");
    agent.stop().expect("stop");
}

#[tokio::test]
async fn get_instance_attaches_without_creating() {
    let broker = MemoryBroker::new();
    let agent = start_agent(&broker);
    let remote = connect_remote(&broker).await;

    let missing = remote
        .get_instance(InstanceRequest {
            class_name: "Counter".into(),
            instance: "ghost".into(),
            ..InstanceRequest::default()
        })
        .await;
    assert!(matches!(missing, Err(VrpcError::Remote(_))));

    remote
        .create(CreateRequest {
            instance: Some("c1".into()),
            args: vec![CallArg::value(json!(10))],
            ..CreateRequest::new("Counter")
        })
        .await
        .expect("create");
    let attached = remote
        .get_instance(InstanceRequest {
            class_name: "Counter".into(),
            instance: "c1".into(),
            ..InstanceRequest::default()
        })
        .await
        .expect("attach");
    assert_eq!(attached.call("increment", vec![]).await.expect("call"), json!(11));

    remote.end().await.expect("end");
    agent.stop().expect("stop");
}

#[tokio::test]
async fn unnamed_create_generates_a_fresh_instance_id() {
    let broker = MemoryBroker::new();
    let agent = start_agent(&broker);
    let remote = connect_remote(&broker).await;

    let first = remote.create(CreateRequest::new("Counter")).await.expect("create");
    let second = remote.create(CreateRequest::new("Counter")).await.expect("create");
    assert_ne!(first.target_id(), second.target_id());
    assert!(first.target_id().starts_with("Counter-"));

    assert_eq!(first.call("increment", vec![]).await.expect("call"), json!(1));
    assert_eq!(second.call("increment", vec![]).await.expect("call"), json!(1));

    remote.end().await.expect("end");
    agent.stop().expect("stop");
}
