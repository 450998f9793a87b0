#![cfg(unix)]

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use remote_object::{
    ClientProtocolConfig, ListenError, MethodCallServer, MethodOutcome, ReconnectConfig,
    RemoteMethods, RemoteObjectConfig, RemoteObjectCreator, Value,
};

struct Calculator;

impl RemoteMethods for Calculator {
    fn call(
        &self,
        method: &str,
        args: Vec<Value>,
        _kwargs: BTreeMap<String, Value>,
    ) -> MethodOutcome {
        match method {
            "echo" => MethodOutcome::ready_ok(args.into_iter().next().unwrap_or(Value::Null)),
            "add" => match (args.first(), args.get(1)) {
                (Some(Value::Int(a)), Some(Value::Int(b))) => MethodOutcome::ready_ok(Value::Int(a + b)),
                _ => MethodOutcome::ready_err("add expects two ints"),
            },
            "slow" => MethodOutcome::deferred(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok(Value::string("done"))
            }),
            "never" => MethodOutcome::deferred(std::future::pending()),
            "nan" => MethodOutcome::ready_ok(Value::Float(f64::NAN)),
            "boom" => panic!("deliberate panic for test coverage"),
            other => MethodOutcome::ready_err(format!("unknown method '{other}'")),
        }
    }
}

fn whitelist() -> HashSet<String> {
    ["echo", "add", "slow", "never", "nan", "boom"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn bind_calculator(path: &std::path::Path) -> Result<Arc<MethodCallServer>, ListenError> {
    let server = MethodCallServer::bind(path, Arc::new(Calculator), whitelist())?;
    Ok(Arc::new(server))
}

#[tokio::test]
async fn echo_round_trips_and_forbidden_method_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let socket = dir.path().join("echo.sock");
    bind_calculator(&socket)?.spawn();

    let (remote, _factory) = RemoteObjectCreator::new(&socket).connect().await?;

    let result = remote.call("echo", vec![Value::string("hi")], BTreeMap::new()).await?;
    assert_eq!(result, Value::string("hi"));

    let err = remote
        .call("whoami", vec![], BTreeMap::new())
        .await
        .expect_err("unwhitelisted method must be rejected");
    assert_eq!(err.message(), "Forbidden method 'whoami'");

    Ok(())
}

#[tokio::test]
async fn deferred_method_resolves_after_the_immediate_reply() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let socket = dir.path().join("slow.sock");
    bind_calculator(&socket)?.spawn();

    let (remote, _factory) = RemoteObjectCreator::new(&socket).connect().await?;
    let result = remote.call("slow", vec![], BTreeMap::new()).await?;
    assert_eq!(result, Value::string("done"));

    Ok(())
}

#[tokio::test]
async fn deferred_response_that_never_arrives_times_out() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let socket = dir.path().join("never.sock");
    bind_calculator(&socket)?.spawn();

    let (remote, _factory) = RemoteObjectCreator::new(&socket)
        .client_config(ClientProtocolConfig::new().deferred_response_timeout(Duration::from_millis(100)))
        .connect()
        .await?;

    let err = remote
        .call("never", vec![], BTreeMap::new())
        .await
        .expect_err("a deferred response that never arrives must time out");
    assert_eq!(err.message(), "timeout");

    Ok(())
}

#[tokio::test]
async fn non_serializable_result_is_reported_as_a_method_call_error() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let socket = dir.path().join("nan.sock");
    bind_calculator(&socket)?.spawn();

    let (remote, _factory) = RemoteObjectCreator::new(&socket).connect().await?;
    let err = remote
        .call("nan", vec![], BTreeMap::new())
        .await
        .expect_err("NaN is not a serializable result");
    assert_eq!(err.message(), "Non-serializable result");

    Ok(())
}

#[tokio::test]
async fn a_panicking_method_body_is_collapsed_to_a_method_call_error() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let socket = dir.path().join("boom.sock");
    bind_calculator(&socket)?.spawn();

    let (remote, _factory) = RemoteObjectCreator::new(&socket).connect().await?;
    let err = remote
        .call("boom", vec![], BTreeMap::new())
        .await
        .expect_err("a panicking method body must not crash the server");
    assert_eq!(err.message(), "deliberate panic for test coverage");

    Ok(())
}

#[tokio::test]
async fn one_hundred_concurrent_calls_all_receive_their_own_reply() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let socket = dir.path().join("concurrent.sock");
    bind_calculator(&socket)?.spawn();

    let (remote, _factory) = RemoteObjectCreator::new(&socket).connect().await?;

    let mut handles = Vec::new();
    for i in 0..100i64 {
        let remote = remote.clone();
        handles.push(tokio::spawn(async move {
            let args = vec![Value::Int(i), Value::Int(1)];
            let result = remote.call("add", args, BTreeMap::new()).await?;
            Ok::<Value, remote_object::MethodCallError>(result)
        }));
    }

    for (i, handle) in handles.into_iter().enumerate() {
        let result = handle.await.unwrap()?;
        assert_eq!(result, Value::Int(i as i64 + 1));
    }

    Ok(())
}

#[tokio::test]
async fn retry_on_reconnect_replays_calls_lost_to_a_dropped_connection() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let socket = dir.path().join("reconnect.sock");
    let server = bind_calculator(&socket)?;
    let accept_task = server.clone().spawn();

    let (remote, factory) = RemoteObjectCreator::new(&socket)
        .reconnect(
            ReconnectConfig::new()
                .initial_delay(Duration::from_millis(20))
                .max_delay(Duration::from_millis(200)),
        )
        .object_config(RemoteObjectConfig::new().retry_on_reconnect(true))
        .connect()
        .await?;

    // Simulate the connection dropping: abort the accept loop and remove the
    // bound socket so in-flight and new connections fail.
    accept_task.abort();
    drop(server);
    std::fs::remove_file(&socket).ok();

    let remote_for_call = remote.clone();
    let call = tokio::spawn(async move { remote_for_call.call("add", vec![Value::Int(40), Value::Int(2)], BTreeMap::new()).await });

    // Give the factory a moment to notice the drop and start backing off,
    // then bring the server back so the pending call gets replayed.
    tokio::time::sleep(Duration::from_millis(60)).await;
    bind_calculator(&socket)?.spawn();

    let result = call.await.unwrap()?;
    assert_eq!(result, Value::Int(42));

    factory.stop();
    Ok(())
}

#[tokio::test]
async fn overall_timeout_gives_up_retrying_if_the_connection_never_returns() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let socket = dir.path().join("overall_timeout.sock");
    let server = bind_calculator(&socket)?;
    let accept_task = server.clone().spawn();

    let (remote, factory) = RemoteObjectCreator::new(&socket)
        .reconnect(
            ReconnectConfig::new()
                .initial_delay(Duration::from_millis(20))
                .max_delay(Duration::from_millis(50)),
        )
        .object_config(
            RemoteObjectConfig::new()
                .retry_on_reconnect(true)
                .timeout(Duration::from_millis(150)),
        )
        .connect()
        .await?;

    // Drop the connection and never bring the server back.
    accept_task.abort();
    drop(server);
    std::fs::remove_file(&socket).ok();

    let err = remote
        .call("add", vec![Value::Int(1), Value::Int(1)], BTreeMap::new())
        .await
        .expect_err("a connection that never comes back must fail once the overall timeout elapses");
    assert_eq!(err.message(), "timeout");
    assert_eq!(remote.pending_request_count().await, 0);

    factory.stop();
    Ok(())
}

struct CountingCalculator {
    invocations: Arc<AtomicUsize>,
}

impl RemoteMethods for CountingCalculator {
    fn call(&self, method: &str, args: Vec<Value>, kwargs: BTreeMap<String, Value>) -> MethodOutcome {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        Calculator.call(method, args, kwargs)
    }
}

#[tokio::test]
async fn forbidden_method_never_reaches_the_exposed_object() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let socket = dir.path().join("whitelist.sock");
    let invocations = Arc::new(AtomicUsize::new(0));
    let server = MethodCallServer::bind(
        &socket,
        Arc::new(CountingCalculator { invocations: invocations.clone() }),
        ["echo".to_string()].into_iter().collect(),
    )?;
    Arc::new(server).spawn();

    let (remote, _factory) = RemoteObjectCreator::new(&socket).connect().await?;

    let err = remote
        .call("add", vec![Value::Int(1), Value::Int(1)], BTreeMap::new())
        .await
        .expect_err("add is not in this server's whitelist");
    assert_eq!(err.message(), "Forbidden method 'add'");
    assert_eq!(invocations.load(Ordering::SeqCst), 0);

    remote.call("echo", vec![Value::Int(9)], BTreeMap::new()).await?;
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    Ok(())
}

#[tokio::test]
async fn disconnect_stops_reconnecting_and_closes_the_transport() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let socket = dir.path().join("disconnect.sock");
    bind_calculator(&socket)?.spawn();

    let (remote, factory) = RemoteObjectCreator::new(&socket)
        .reconnect(ReconnectConfig::new().initial_delay(Duration::from_millis(20)))
        .connect()
        .await?;

    remote.call("echo", vec![Value::Int(1)], BTreeMap::new()).await?;

    factory.disconnect().await;
    assert!(factory.current().await.is_none());

    // Give the (now stopped) reconnect loop a moment; it must not reconnect.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(factory.current().await.is_none());

    Ok(())
}

#[tokio::test]
async fn pending_tables_are_empty_once_every_call_has_terminated() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let socket = dir.path().join("cleanup.sock");
    bind_calculator(&socket)?.spawn();

    let (remote, factory) = RemoteObjectCreator::new(&socket)
        .client_config(ClientProtocolConfig::new().deferred_response_timeout(Duration::from_millis(100)))
        .connect()
        .await?;

    remote.call("echo", vec![Value::Int(1)], BTreeMap::new()).await?;
    remote.call("slow", vec![], BTreeMap::new()).await?;
    let _ = remote.call("never", vec![], BTreeMap::new()).await;
    let _ = remote.call("whoami", vec![], BTreeMap::new()).await;

    let protocol = factory.current().await.expect("still connected");
    assert_eq!(protocol.pending_call_count().await, 0);
    assert_eq!(protocol.pending_response_count().await, 0);

    Ok(())
}

#[tokio::test]
async fn without_retry_on_reconnect_a_dropped_connection_fails_immediately() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let socket = dir.path().join("no_retry.sock");
    let server = bind_calculator(&socket)?;
    let accept_task = server.clone().spawn();

    let (remote, factory) = RemoteObjectCreator::new(&socket)
        .object_config(RemoteObjectConfig::new().retry_on_reconnect(false))
        .connect()
        .await?;

    accept_task.abort();
    drop(server);
    std::fs::remove_file(&socket).ok();

    // Give the reader loop a moment to notice the peer is gone.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let err = remote
        .call("add", vec![Value::Int(1), Value::Int(1)], BTreeMap::new())
        .await
        .expect_err("without retry_on_reconnect, a dropped connection must fail immediately");
    assert!(!err.message().is_empty());

    factory.stop();
    Ok(())
}
