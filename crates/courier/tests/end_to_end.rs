//! Calls driven through the real `courier-worker` binary.

use std::time::{Duration, Instant};

use serde_json::json;

use courier::error::AbortReason;
use courier::{
    CallError, CallModel, Executor, ExecutorConfig, InvocationContext, InvocationRequest,
    MethodError, Methods, Progress, ProgressSink,
};

const WORKER: &str = env!("CARGO_BIN_EXE_courier-worker");

fn executor() -> Executor {
    courier::logging::init_tracing();
    let config = ExecutorConfig::new()
        .with_worker(WORKER)
        .with_poll_interval(Duration::from_millis(100));
    Executor::new(config)
}

fn is_gone(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    matches!(kill(Pid::from_raw(pid as i32), None), Err(Errno::ESRCH))
}

#[tokio::test]
async fn add_returns_sum() {
    let ctx = InvocationContext::new();
    let outcome = executor()
        .execute(InvocationRequest::new("add").with_args([2, 3]), &ctx)
        .await;

    assert_eq!(outcome.unwrap(), json!(5));
    assert!(ctx.progress().history().is_empty());
}

#[tokio::test]
async fn progress_arrives_in_order_before_result() {
    let sink = ProgressSink::with_callback(|p| assert!(p.completed <= p.total));
    let ctx = InvocationContext::with_progress(sink);
    let outcome = executor()
        .execute(InvocationRequest::new("progress"), &ctx)
        .await;

    assert_eq!(outcome.unwrap(), json!("done"));
    let seen: Vec<u64> = ctx.progress().history().iter().map(|p| p.completed).collect();
    assert_eq!(seen, vec![25, 50, 100]);
}

#[tokio::test]
async fn division_by_zero_is_raised() {
    let outcome = executor()
        .execute(
            InvocationRequest::new("divide").with_args([1, 0]),
            &InvocationContext::new(),
        )
        .await;

    match outcome {
        Err(CallError::Raised(raised)) => {
            assert_eq!(raised.kind, "panic");
            assert_eq!(raised.message, "attempt to divide by zero");
            assert!(raised.trace.is_some());
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[tokio::test]
async fn typed_error_keeps_its_identity() {
    let outcome = executor()
        .execute(
            InvocationRequest::new("parse").with_arg("12x"),
            &InvocationContext::new(),
        )
        .await;

    match outcome {
        Err(CallError::Raised(raised)) => {
            assert!(raised.is::<std::num::ParseIntError>());
            assert_eq!(raised.message, "invalid digit found in string");
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[tokio::test]
async fn reported_failure_is_an_application_error() {
    let outcome = executor()
        .execute(
            InvocationRequest::new("fail").with_kwarg("reason", "quota exceeded"),
            &InvocationContext::new(),
        )
        .await;

    match outcome {
        Err(CallError::Application(description)) => assert_eq!(description, "quota exceeded"),
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[tokio::test]
async fn cancellation_kills_and_reaps_the_worker() {
    let ctx = InvocationContext::new();
    let canceller = ctx.clone();
    let watched = ctx.clone();
    tokio::spawn(async move {
        // Wait for the worker to report its pid, then cancel 50ms later
        while watched.progress().latest().is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let started = Instant::now();
    let outcome = executor()
        .execute(InvocationRequest::new("sleep").with_arg(10.0), &ctx)
        .await;
    let elapsed = started.elapsed();

    assert!(matches!(
        outcome,
        Err(CallError::Aborted(AbortReason::Cancelled))
    ));
    assert!(elapsed < Duration::from_secs(3), "took {:?}", elapsed);

    let pid = ctx
        .progress()
        .latest()
        .and_then(|p| p.details)
        .and_then(|d| d["pid"].as_u64())
        .expect("worker reported its pid");
    assert!(is_gone(pid as u32), "worker {} was not reaped", pid);
}

#[tokio::test]
async fn cancel_mid_sleep_kills_within_one_poll() {
    let ctx = InvocationContext::new();
    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let started = Instant::now();
    let outcome = executor()
        .execute(InvocationRequest::new("sleep").with_arg(10.0), &ctx)
        .await;
    let elapsed = started.elapsed();

    assert!(matches!(
        outcome,
        Err(CallError::Aborted(AbortReason::Cancelled))
    ));
    // 50ms + one 100ms poll, plus headroom for spawn and reap
    assert!(elapsed < Duration::from_millis(400), "took {:?}", elapsed);
}

#[tokio::test]
async fn cancelled_before_start_is_aborted() {
    let ctx = InvocationContext::new();
    ctx.cancel();

    let outcome = executor()
        .execute(InvocationRequest::new("sleep").with_arg(10.0), &ctx)
        .await;
    assert!(outcome.unwrap_err().is_cancelled());
}

#[tokio::test]
async fn crash_is_distinct_from_cancellation() {
    let outcome = executor()
        .execute(InvocationRequest::new("crash"), &InvocationContext::new())
        .await;

    match outcome {
        Err(CallError::Aborted(AbortReason::WorkerExited(detail))) => {
            assert_eq!(detail, "killed by signal 6")
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[tokio::test]
async fn exit_without_reply_reports_exit_code() {
    let outcome = executor()
        .execute(InvocationRequest::new("exit").with_arg(7), &InvocationContext::new())
        .await;

    match outcome {
        Err(CallError::Aborted(AbortReason::WorkerExited(detail))) => {
            assert_eq!(detail, "exit code 7")
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[tokio::test]
async fn stray_output_does_not_corrupt_the_channel() {
    let outcome = executor()
        .execute(InvocationRequest::new("noisy"), &InvocationContext::new())
        .await;
    assert_eq!(outcome.unwrap(), json!(true));
}

#[tokio::test]
async fn unknown_method_is_raised() {
    let outcome = executor()
        .execute(InvocationRequest::new("no_such_method"), &InvocationContext::new())
        .await;

    match outcome {
        Err(CallError::Raised(raised)) => assert_eq!(raised.kind, "MethodNotFound"),
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[tokio::test]
async fn arguments_cross_the_process_boundary() {
    let request = InvocationRequest::new("echo")
        .with_args([json!(1), json!("two"), json!([3])])
        .with_kwarg("flag", true);
    let outcome = executor()
        .execute(request, &InvocationContext::new())
        .await;

    assert_eq!(
        outcome.unwrap(),
        json!({ "args": [1, "two", [3]], "kwargs": { "flag": true } })
    );
}

#[tokio::test]
async fn pings_do_not_disturb_the_outcome() {
    let config = ExecutorConfig::new()
        .with_worker(WORKER)
        .with_ping_interval(Some(Duration::from_millis(10)));
    let outcome = Executor::new(config)
        .execute(InvocationRequest::new("sleep").with_arg(0.1), &InvocationContext::new())
        .await;
    assert_eq!(outcome.unwrap(), json!(0.1));
}

#[tokio::test]
async fn direct_model_uses_local_methods() {
    let methods = Methods::new().with("scale", |call| {
        let x: f64 = call.arg(0)?;
        let factor: f64 = call.kwarg("factor")?.unwrap_or(2.0);
        call.report(Progress::new(1, 1));
        if factor.is_nan() {
            return Err(MethodError::failed("factor is NaN"));
        }
        Ok(json!(x * factor))
    });
    let executor = executor().with_local_methods(methods);

    let ctx = InvocationContext::new();
    let request = InvocationRequest::new("scale")
        .with_arg(1.5)
        .with_model(CallModel::Direct);
    assert_eq!(executor.execute(request, &ctx).await.unwrap(), json!(3.0));
    assert_eq!(ctx.progress().latest(), Some(Progress::new(1, 1)));
}
