//! Function 模式集成测试：一次注册、一次调用、一次注销

mod common;

use common::{CountingRegistry, HelloRequest, HelloResponse, greeter, wait_for_state};
use flare_micro::runtime::{LeaseState, OptionSet, Runtime, new_function, options};
use flare_micro::transport::{CallOptions, ServiceHandler};
use flare_micro::{ErrorKind, Registry};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::Status;

fn function_options(registry: &Arc<CountingRegistry>, ctx: &CancellationToken) -> OptionSet {
    let registry: Arc<dyn Registry> = registry.clone();
    OptionSet::new()
        .with(options::name("test.function"))
        .with(options::registry(registry))
        .with(options::context(ctx.clone()))
        .with(options::handle_signal(false))
}

fn spawn_run(function: &Runtime) -> JoinHandle<flare_micro::Result<()>> {
    let function = function.clone();
    tokio::spawn(async move { function.run().await })
}

async fn say_hello(function: &Runtime, name: &str) -> Result<HelloResponse, Status> {
    function
        .client()
        .invoke(
            &CallOptions::default(),
            "test.function",
            "Say.Hello",
            &HelloRequest { name: name.into() },
        )
        .await
}

#[tokio::test]
async fn function_registers_serves_once_and_deregisters() {
    let registry = CountingRegistry::new();
    let ctx = CancellationToken::new();
    let function = new_function(function_options(&registry, &ctx)).unwrap();

    let journal = registry.clone();
    function
        .handle(Arc::new(ServiceHandler::new("Say").endpoint(
            "Hello",
            move |req: HelloRequest| {
                let journal = journal.clone();
                async move {
                    journal.record("invoke");
                    Ok(HelloResponse {
                        msg: format!("Hello {}", req.name),
                    })
                }
            },
        )))
        .await
        .unwrap();

    let running = spawn_run(&function);
    wait_for_state(&function, LeaseState::Active).await;

    let response = say_hello(&function, "John").await.unwrap();
    assert_eq!(response.msg, "Hello John");

    tokio::time::timeout(Duration::from_secs(10), running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(registry.registers(), 1);
    assert_eq!(registry.deregisters(), 1);
    assert_eq!(registry.journal(), vec!["register", "invoke", "deregister"]);
    assert_eq!(function.state(), LeaseState::Unregistered);
}

#[tokio::test]
async fn concurrent_invocations_admit_exactly_one() {
    let registry = CountingRegistry::new();
    let ctx = CancellationToken::new();
    let function = new_function(function_options(&registry, &ctx)).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    function
        .handle(Arc::new(ServiceHandler::new("Say").endpoint("Hello", {
            let calls = calls.clone();
            move |req: HelloRequest| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(HelloResponse {
                        msg: format!("Hello {}", req.name),
                    })
                }
            }
        })))
        .await
        .unwrap();

    let running = spawn_run(&function);
    wait_for_state(&function, LeaseState::Active).await;

    let (first, second) = tokio::join!(say_hello(&function, "a"), say_hello(&function, "b"));
    let succeeded = [first.is_ok(), second.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(succeeded, 1, "first = {:?}, second = {:?}", first, second);

    tokio::time::timeout(Duration::from_secs(10), running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(registry.deregisters(), 1);
}

#[tokio::test]
async fn spent_function_refuses_to_run_again() {
    let registry = CountingRegistry::new();
    let ctx = CancellationToken::new();
    let function = new_function(function_options(&registry, &ctx)).unwrap();
    function
        .handle(Arc::new(greeter(Arc::new(AtomicUsize::new(0)))))
        .await
        .unwrap();

    let running = spawn_run(&function);
    wait_for_state(&function, LeaseState::Active).await;
    say_hello(&function, "John").await.unwrap();
    running.await.unwrap().unwrap();

    let err = function.run().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
    assert_eq!(registry.registers(), 1);
}

#[tokio::test]
async fn failed_invocation_still_completes_the_function() {
    let registry = CountingRegistry::new();
    let ctx = CancellationToken::new();
    let function = new_function(function_options(&registry, &ctx)).unwrap();
    function
        .handle(Arc::new(ServiceHandler::new("Say").endpoint(
            "Hello",
            |_req: HelloRequest| async move { Err::<HelloResponse, _>(Status::internal("boom")) },
        )))
        .await
        .unwrap();

    let running = spawn_run(&function);
    wait_for_state(&function, LeaseState::Active).await;

    let err = say_hello(&function, "John").await.unwrap_err();
    assert_eq!(err.code(), tonic::Code::Internal);

    tokio::time::timeout(Duration::from_secs(10), running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(registry.deregisters(), 1);
}

#[tokio::test]
async fn panicking_invocation_still_completes_the_function() {
    let registry = CountingRegistry::new();
    let ctx = CancellationToken::new();
    let function = new_function(function_options(&registry, &ctx)).unwrap();
    function
        .handle(Arc::new(ServiceHandler::new("Say").endpoint(
            "Hello",
            |req: HelloRequest| async move {
                if !req.name.is_empty() {
                    panic!("handler crashed for {}", req.name);
                }
                Ok(HelloResponse { msg: String::new() })
            },
        )))
        .await
        .unwrap();

    let running = spawn_run(&function);
    wait_for_state(&function, LeaseState::Active).await;

    let err = say_hello(&function, "John").await.unwrap_err();
    assert_eq!(err.code(), tonic::Code::Internal);

    tokio::time::timeout(Duration::from_secs(10), running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(registry.deregisters(), 1);
    assert_eq!(function.state(), LeaseState::Unregistered);
}

#[tokio::test]
async fn cancelled_function_deregisters_without_invocation() {
    let registry = CountingRegistry::new();
    let ctx = CancellationToken::new();
    let function = new_function(function_options(&registry, &ctx)).unwrap();

    let running = spawn_run(&function);
    wait_for_state(&function, LeaseState::Active).await;
    ctx.cancel();

    running.await.unwrap().unwrap();
    assert_eq!(registry.registers(), 1);
    assert_eq!(registry.deregisters(), 1);
    assert_eq!(function.state(), LeaseState::Unregistered);
}

#[tokio::test]
async fn function_defaults_carry_a_bounded_lease() {
    let registry = CountingRegistry::new();
    let ctx = CancellationToken::new();
    let function = new_function(function_options(&registry, &ctx)).unwrap();

    let options = function.options();
    assert_eq!(options.register_ttl, Some(Duration::from_secs(60)));
    assert_eq!(options.register_interval, Some(Duration::from_secs(30)));
}

#[tokio::test(start_paused = true)]
async fn idle_function_keeps_its_lease_alive() {
    let registry = CountingRegistry::new();
    let ctx = CancellationToken::new();
    let function = new_function(function_options(&registry, &ctx)).unwrap();

    let running = spawn_run(&function);
    wait_for_state(&function, LeaseState::Active).await;

    // 超过默认 60s 的 TTL 仍可被解析
    tokio::time::sleep(Duration::from_secs(90)).await;
    assert_eq!(registry.resolve("test.function").await.unwrap().len(), 1);
    assert!(registry.registers() >= 3, "registers = {}", registry.registers());
    assert!(function.subscribe().borrow().renewals >= 2);

    ctx.cancel();
    running.await.unwrap().unwrap();
    assert_eq!(registry.deregisters(), 1);
}
