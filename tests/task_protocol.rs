//! End-to-end tests for tasks, pipes and coordinated batches.

use isotask::runtime::codec::EncodedProgram;
use isotask::runtime::value::NodeRef;
use isotask::runtime::TaskState;
use isotask::{
    decode, encode, Error, Result, TaskCoordinator, TaskDescriptor, TaskExecutor, TaskOutput,
    TaskRegistry, Value,
};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();

    registry
        .register_task("one", |_ctx| Ok(TaskOutput::ready(1)))
        .unwrap();

    registry
        .register_task("identity", |ctx| Ok(TaskOutput::ready(ctx.arg(0))))
        .unwrap();

    registry
        .register_function("base", |_receiver, _args| Ok(Value::from("return value!")))
        .unwrap();

    registry
        .register_task("complex", |_ctx| {
            let object = NodeRef::object([
                ("a", Value::Int(1)),
                ("b", Value::object([("c", Value::from("foobar"))])),
            ]);
            object.set_delegate(Some(NodeRef::object([("base", Value::function("base"))])));
            Ok(TaskOutput::ready(object))
        })
        .unwrap();

    registry
        .register_task("cycle", |_ctx| {
            let node = NodeRef::object([("name", Value::from("ouroboros"))]);
            node.set("tail", node.clone());
            Ok(TaskOutput::ready(node))
        })
        .unwrap();

    registry
        .register_task("delayed", |ctx| {
            let value = ctx.arg(0);
            let delay = ctx.arg(1).as_int().unwrap_or(0) as u64;
            Ok(TaskOutput::pending(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(value)
            }))
        })
        .unwrap();

    registry
        .register_task("fragile", |ctx| {
            ctx.pipe().subscribe(|_value| panic!("handler blew up"));
            Ok(TaskOutput::pending(async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(Value::from("completed anyway"))
            }))
        })
        .unwrap();

    registry
        .register_task("echo", |ctx| {
            let expected = ctx.arg(0).as_int().unwrap_or(0);
            let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
            let reply = ctx.pipe().clone();
            ctx.pipe().subscribe(move |value| {
                reply.post_message(value.clone());
                let _ = seen_tx.send(());
            });
            Ok(TaskOutput::pending(async move {
                for _ in 0..expected {
                    if seen_rx.recv().await.is_none() {
                        break;
                    }
                }
                Ok(Value::Int(expected))
            }))
        })
        .unwrap();

    registry
        .register_task("chatter", |ctx| {
            for i in 1..=3 {
                ctx.pipe().post_message(i);
            }
            Ok(TaskOutput::ready("done"))
        })
        .unwrap();

    registry
        .register_task("depth", |ctx| {
            let mut count = 0i64;
            let mut current = ctx.arg(0);
            while let Some(node) = current.as_node().cloned() {
                count += 1;
                current = node.get_own("next").unwrap_or(Value::Null);
            }
            Ok(TaskOutput::ready(Value::array([Value::Int(count), ctx.arg(0)])))
        })
        .unwrap();

    registry
        .register_task("panics", |_ctx| -> Result<TaskOutput> { panic!("task blew up") })
        .unwrap();

    registry
        .register_task("rejects", |_ctx| Err(Error::ContextFault("rejected on purpose".into())))
        .unwrap();

    registry
}

fn executor() -> TaskExecutor {
    init_tracing();
    TaskExecutor::new(registry())
}

fn linked_list(len: i64) -> Value {
    let mut head = Value::Null;
    for i in (0..len).rev() {
        head = Value::object([("value", Value::Int(i)), ("next", head)]);
    }
    head
}

#[tokio::test(flavor = "multi_thread")]
async fn basic_task_resolves_its_value() {
    let result = executor().run("one", []).await.unwrap();
    assert_eq!(result, Value::Int(1));
}

#[tokio::test(flavor = "multi_thread")]
async fn complex_result_keeps_delegated_behavior() {
    let executor = executor();
    let result = executor.run("complex", []).await.unwrap();

    assert_eq!(result.get("a"), Some(Value::Int(1)));
    let b = result.get("b").unwrap();
    assert_eq!(b.get("c"), Some(Value::from("foobar")));

    let node = result.as_node().unwrap();
    assert!(!node.has_own("base"));
    let delegate = node.delegate().unwrap();
    assert_eq!(delegate.get_own("base"), Some(Value::function("base")));

    let called = executor
        .registry()
        .call_method(&result, "base", Vec::new())
        .unwrap();
    assert_eq!(called, Value::from("return value!"));
}

#[tokio::test(flavor = "multi_thread")]
async fn cyclic_result_keeps_identity() {
    let result = executor().run("cycle", []).await.unwrap();
    let node = result.as_node().unwrap().clone();

    assert_eq!(node.get_own("name"), Some(Value::from("ouroboros")));
    assert_eq!(node.get_own("tail"), Some(result.clone()));
    node.clear();
}

#[tokio::test(flavor = "multi_thread")]
async fn arguments_cross_with_aliasing_and_containers() {
    let shared = Value::object([("n", Value::Int(1))]);
    let set = Value::set([Value::Int(1), Value::Int(2), Value::Int(3)]);
    let map = Value::map([(shared.clone(), Value::from("keyed by object"))]);
    let arg = Value::object([
        ("left", shared.clone()),
        ("right", shared),
        ("set", set),
        ("map", map),
        ("when", Value::Date(1_700_000_000_000)),
        ("pattern", Value::regex("^a+$", "i")),
    ]);

    let result = executor().run("identity", [arg.clone()]).await.unwrap();
    assert!(result.deep_eq(&arg));
    assert_ne!(result, arg);

    let left = result.get("left").unwrap();
    assert_eq!(result.get("right"), Some(left.clone()));
    left.as_node().unwrap().set("n", 2);
    assert_eq!(
        result.get("right").and_then(|right| right.get("n")),
        Some(Value::Int(2))
    );

    let set = result.get("set").unwrap();
    let set = set.as_node().unwrap();
    assert_eq!(set.len(), 3);
    assert!(set.contains(&Value::Int(2)));

    let map = result.get("map").unwrap();
    assert_eq!(
        map.as_node().unwrap().map_get(&left),
        Some(Value::from("keyed by object"))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn pipe_echo_round_trips_messages() {
    let handle = executor().run("echo", [Value::Int(2)]);
    let pipe = handle.pipe().clone();

    let echoed = Arc::new(Mutex::new(Vec::new()));
    let sink = echoed.clone();
    pipe.subscribe(move |value| sink.lock().push(value.clone()));

    let shared = Value::array([Value::Int(7)]);
    pipe.post_message(Value::array([shared.clone(), shared]));
    pipe.post_message("second");

    assert_eq!(handle.join().await.unwrap(), Value::Int(2));

    let echoed = echoed.lock();
    assert_eq!(echoed.len(), 2);
    let first = echoed[0].as_node().unwrap();
    assert_eq!(first.at(0), first.at(1));
    assert_eq!(echoed[1], Value::from("second"));
}

#[tokio::test(flavor = "multi_thread")]
async fn messages_before_subscribe_are_buffered() {
    let handle = executor().run("chatter", []);
    let pipe = handle.pipe().clone();

    assert_eq!(handle.join().await.unwrap(), Value::from("done"));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    pipe.subscribe(move |value| sink.lock().push(value.clone()));
    assert_eq!(*seen.lock(), vec![Value::Int(1), Value::Int(2), Value::Int(3)]);

    // sending side is torn down once the task settles
    pipe.post_message("too late");
    assert!(pipe.is_closed());
}

#[tokio::test(flavor = "multi_thread")]
async fn coordinator_orders_by_submission() {
    let coordinator = TaskCoordinator::new(executor());
    let results = coordinator
        .run_all(vec![
            TaskDescriptor::new("delayed").with_arg(1).with_arg(50),
            TaskDescriptor::new("delayed").with_arg(2).with_arg(0),
        ])
        .await
        .unwrap();
    assert_eq!(results, vec![Value::Int(1), Value::Int(2)]);
}

#[tokio::test(flavor = "multi_thread")]
async fn coordinator_collects_ten_tasks_in_order() {
    let coordinator = TaskCoordinator::new(executor());
    let descriptors = (0..10)
        .map(|i| TaskDescriptor::new("delayed").with_arg(i).with_arg(10 - i))
        .collect();

    let results = coordinator.run_all(descriptors).await.unwrap();
    let expected: Vec<Value> = (0..10).map(Value::Int).collect();
    assert_eq!(results, expected);
}

#[tokio::test(flavor = "multi_thread")]
async fn coordinator_rejects_on_first_failure() {
    let coordinator = TaskCoordinator::new(executor());
    let err = coordinator
        .run_all(vec![
            TaskDescriptor::new("one"),
            TaskDescriptor::new("rejects"),
            TaskDescriptor::new("delayed").with_arg(3).with_arg(100),
        ])
        .await
        .unwrap_err();

    match err {
        Error::Task { index, source } => {
            assert_eq!(index, 1);
            assert!(source.to_string().contains("rejected on purpose"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn panicking_body_is_a_context_fault() {
    let handle = executor().run("panics", []);
    let id = handle.id();
    let err = handle.await.unwrap_err();

    assert!(err.is_context_fault(), "task {id}: {err}");
    assert!(err.to_string().contains("task blew up"));
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_task_fails_through_completion() {
    let handle = executor().submit(TaskDescriptor::new("does-not-exist"));
    assert_ne!(handle.state(), TaskState::Completed);

    let err = handle.await.unwrap_err();
    assert!(err.is_context_fault());
    assert!(matches!(err, Error::UnknownTask(name) if name == "does-not-exist"));
}

#[tokio::test(flavor = "multi_thread")]
async fn panicking_task_handler_fails_the_task() {
    init_tracing();
    let handle = executor().run("fragile", []);
    handle.pipe().post_message(1);

    let err = handle.await.unwrap_err();
    assert!(err.is_context_fault(), "{err}");
    assert!(err.to_string().contains("handler blew up"));
}

#[tokio::test(flavor = "multi_thread")]
async fn deep_graph_crosses_both_ways() {
    let list = linked_list(100_000);
    let result = executor().run("depth", [list.clone()]).await.unwrap();

    let node = result.as_node().unwrap();
    assert_eq!(node.at(0), Some(Value::Int(100_000)));

    let mut current = node.at(1).unwrap();
    let mut expected = 0;
    while let Some(value) = current.get("value") {
        assert_eq!(value, Value::Int(expected));
        expected += 1;
        current = current.get("next").unwrap();
    }
    assert_eq!(expected, 100_000);
}

#[test]
fn encoded_program_survives_json() {
    let shared = Value::object([("id", Value::Int(9))]);
    let value = Value::object([
        ("nan", Value::Float(f64::NAN)),
        ("inf", Value::Float(f64::NEG_INFINITY)),
        ("items", Value::array([shared.clone(), shared, Value::Undefined])),
        ("tags", Value::set([Value::from("a"), Value::from("b")])),
    ]);

    let program = encode(&value);
    let json = serde_json::to_string(&program).unwrap();
    let back: EncodedProgram = serde_json::from_str(&json).unwrap();
    let decoded = decode(&back).unwrap();

    assert!(decoded.deep_eq(&value));
    let items = decoded.get("items").unwrap();
    let items = items.as_node().unwrap();
    assert_eq!(items.at(0), items.at(1));
}

#[test]
fn nested_object_round_trips() {
    let value = Value::object([
        ("a", Value::Int(1)),
        ("b", Value::object([("c", Value::from("x"))])),
    ]);
    let decoded = decode(&encode(&value)).unwrap();
    assert!(decoded.deep_eq(&value));
    assert_eq!(decoded.get("b").and_then(|b| b.get("c")), Some(Value::from("x")));
}

fn leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Undefined),
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Int),
        any::<f64>().prop_map(Value::Float),
        "[a-z]{0,8}".prop_map(Value::String),
        any::<i64>().prop_map(Value::Date),
    ]
}

fn acyclic_graph() -> impl Strategy<Value = Value> {
    leaf().prop_recursive(4, 64, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..6).prop_map(|items| Value::array(items)),
            prop::collection::vec(("[a-z]{1,4}", inner.clone()), 0..6).prop_map(|props| Value::object(props)),
            prop::collection::vec(inner, 0..6).prop_map(|members| Value::set(members)),
        ]
    })
}

proptest! {
    #[test]
    fn acyclic_graphs_round_trip(value in acyclic_graph()) {
        let decoded = decode(&encode(&value)).unwrap();
        prop_assert!(decoded.deep_eq(&value));
    }
}
