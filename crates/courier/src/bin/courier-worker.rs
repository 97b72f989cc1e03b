//! Reference worker with a small set of demo methods.
//!
//! Spawned by an executor, one process per call:
//! `ExecutorConfig::new().with_worker(path_to_this_binary)`.

use std::time::Duration;

use anyhow::Context;
use serde_json::json;

use courier::{MethodError, Methods, Progress};

fn methods() -> Methods {
    Methods::new()
        .with("echo", |call| {
            Ok(json!({ "args": call.args(), "kwargs": call.kwargs() }))
        })
        .with("add", |call| {
            let a: i64 = call.arg(0)?;
            let b: i64 = call.arg(1)?;
            Ok(json!(a + b))
        })
        .with("divide", |call| {
            let a: i64 = call.arg(0)?;
            let b: i64 = call.arg(1)?;
            // Panics on zero, like any integer division
            Ok(json!(a / b))
        })
        .with("parse", |call| {
            let text: String = call.arg(0)?;
            text.parse::<i64>()
                .map(|n| json!(n))
                .map_err(|e| MethodError::capture(&e))
        })
        .with("progress", |call| {
            let steps: Vec<u64> = call.kwarg("steps")?.unwrap_or_else(|| vec![25, 50, 100]);
            for completed in steps {
                call.report(Progress::new(completed, 100));
            }
            Ok(json!("done"))
        })
        .with("sleep", |call| {
            let seconds: f64 = call.arg(0)?;
            call.report(Progress::new(0, 1).with_details(json!({ "pid": std::process::id() })));
            std::thread::sleep(Duration::from_secs_f64(seconds));
            Ok(json!(seconds))
        })
        .with("fail", |call| {
            let reason: Option<String> = call.kwarg("reason")?;
            Err(MethodError::failed(reason.unwrap_or_else(|| "failed".to_string())))
        })
        .with("noisy", |_| {
            println!("this line must not reach the reply channel");
            let status = std::process::Command::new("sh")
                .args(["-c", "echo from a grandchild"])
                .status()
                .map_err(|e| MethodError::capture(&e))?;
            Ok(json!(status.success()))
        })
        .with("exit", |call| {
            let code: i32 = call.arg(0)?;
            std::process::exit(code)
        })
        .with("crash", |_| std::process::abort())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    courier::logging::init_tracing();

    courier::run_worker(methods())
        .await
        .context("worker failed")?;
    Ok(())
}
