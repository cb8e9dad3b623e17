//! Procedures served by the child process.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use portlink::{ChannelInfo, Observable, ProcedureError, Router};
use serde::{Deserialize, Serialize};
use tracing::debug;

const PROCEDURES_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::procedures");

/// Per-call context derived from the channel.
#[derive(Debug, Clone)]
pub struct DemoContext {
    /// Name of the channel the call arrived on.
    pub channel: String,
}

impl DemoContext {
    /// Builds the context for a call arriving on `info`.
    ///
    /// # Errors
    ///
    /// Never fails; the signature matches what the handler expects.
    pub fn from_channel(info: &ChannelInfo) -> Result<Self, ProcedureError> {
        Ok(Self {
            channel: info.name().to_owned(),
        })
    }
}

/// Input of `greeting.echo`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EchoRequest {
    /// Text to echo.
    pub message: String,
}

/// Result of `greeting.echo`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EchoReply {
    /// The echoed text.
    pub message: String,
    /// Channel that served the call.
    pub channel: String,
}

/// Input of `clock.ticks`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TickRequest {
    /// Delay between ticks.
    pub interval_ms: u64,
}

/// Input of `math.divide`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DivideRequest {
    /// Number to divide.
    pub dividend: i64,
    /// Number to divide by; zero is rejected.
    pub divisor: i64,
}

/// Returns the router served by `--serve`.
#[must_use]
pub fn router() -> Router<DemoContext> {
    Router::new()
        .merge("greeting", Router::new().query("echo", echo))
        .merge("clock", Router::new().subscription("ticks", ticks))
        .merge("math", Router::new().query("divide", divide))
}

#[expect(
    clippy::unnecessary_wraps,
    reason = "procedures share the fallible resolver signature"
)]
fn echo(ctx: &DemoContext, request: EchoRequest) -> Result<EchoReply, ProcedureError> {
    Ok(EchoReply {
        message: request.message,
        channel: ctx.channel.clone(),
    })
}

fn ticks(
    _ctx: &DemoContext,
    request: TickRequest,
) -> Result<Observable<u64, ProcedureError>, ProcedureError> {
    if request.interval_ms == 0 {
        return Err(ProcedureError::bad_request("interval_ms must be positive"));
    }
    let interval = Duration::from_millis(request.interval_ms);
    Ok(Observable::new(move |observer| {
        let stopped = Arc::new(AtomicBool::new(false));
        let running = Arc::clone(&stopped);
        thread::spawn(move || {
            let mut tick = 0_u64;
            while !running.load(Ordering::SeqCst) && !observer.is_closed() {
                thread::sleep(interval);
                tick += 1;
                observer.next(tick);
            }
            debug!(target: PROCEDURES_TARGET, ticks = tick, "clock stopped");
        });
        Box::new(move || stopped.store(true, Ordering::SeqCst))
    }))
}

fn divide(_ctx: &DemoContext, request: DivideRequest) -> Result<i64, ProcedureError> {
    request
        .dividend
        .checked_div(request.divisor)
        .ok_or_else(|| ProcedureError::bad_request("cannot divide by zero"))
}
