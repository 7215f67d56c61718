//! Demo handlers registered by `taskhub run`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use taskhub_core::{HandlerError, LogCategory, LogLevel, Parameters};
use taskhub_scheduler::{handler_fn, ExecutionContext, HandlerRegistry};

pub const SIMULATE: &str = "simulate";
pub const FAIL: &str = "fail";
pub const STUBBORN: &str = "stubborn";

fn param_u64(parameters: &Parameters, key: &str, default: u64) -> u64 {
    parameters.get(key).and_then(Value::as_u64).unwrap_or(default)
}

/// Damped relaxation toward zero, reporting a residual per step.
async fn simulate(parameters: Arc<Parameters>, ctx: ExecutionContext) -> Result<Value, HandlerError> {
    let steps = param_u64(&parameters, "steps", 10).max(1);
    let step_ms = param_u64(&parameters, "step_ms", 50);
    let damping = parameters.get("damping").and_then(Value::as_f64).unwrap_or(0.5);
    if !(0.0..1.0).contains(&damping) {
        return Err(HandlerError::new("ValueError", format!("bad parameter: damping={damping}")));
    }

    ctx.emit_log(
        LogLevel::Info,
        LogCategory::Equation,
        "relaxation update",
        "Press et al., Numerical Recipes, 19.5",
        Some(r"u_{n+1} = \lambda u_n".to_string()),
        None,
    );

    let mut residual = 1.0_f64;
    for step in 1..=steps {
        if ctx.is_cancelled() {
            ctx.log(LogLevel::Warning, LogCategory::Info, format!("stopping at step {step}"));
            return Ok(json!({ "steps": step - 1, "residual": residual, "stopped": true }));
        }
        tokio::time::sleep(Duration::from_millis(step_ms)).await;
        residual *= damping;
        let metrics = HashMap::from([("residual".to_string(), residual)]);
        ctx.emit_progress(step as f64 / steps as f64, format!("step {step}/{steps}"), metrics);
    }

    ctx.log(LogLevel::Info, LogCategory::Result, format!("converged to {residual:.3e}"));
    Ok(json!({ "steps": steps, "residual": residual }))
}

/// Always fails after one step.
async fn fail(parameters: Arc<Parameters>, ctx: ExecutionContext) -> Result<Value, HandlerError> {
    ctx.emit_progress(0.1, "validating inputs", HashMap::new());
    let dt = parameters.get("dt").and_then(Value::as_f64).unwrap_or(-1.0);
    Err(HandlerError::new("ValueError", format!("bad parameter: dt={dt} must be positive")))
}

/// Never looks at the cancellation flag.
async fn stubborn(_parameters: Arc<Parameters>, ctx: ExecutionContext) -> Result<Value, HandlerError> {
    ctx.log(LogLevel::Info, LogCategory::Compute, "entering a long uninterruptible section");
    tokio::time::sleep(Duration::from_secs(3600)).await;
    Ok(Value::Null)
}

pub fn handlers() -> HandlerRegistry {
    HandlerRegistry::new()
        .with(SIMULATE, handler_fn(simulate))
        .with(FAIL, handler_fn(fail))
        .with(STUBBORN, handler_fn(stubborn))
}
