//! Default mode: spawns the serving child and calls into it.

use std::env;
use std::io::Write;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Sender};

use portlink::{ChannelInfo, Client, ClientError, Link, Port, SubscriptionCallbacks};
use portlink_config::Config;
use tracing::{debug, info};

use crate::DemoError;
use crate::cli::Cli;
use crate::procedures::{DivideRequest, EchoReply, EchoRequest, TickRequest};

const PARENT_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::parent");

enum TickEvent {
    Tick(u64),
    Failed(ClientError),
    Ended,
}

fn forward(sender: &Sender<TickEvent>, event: TickEvent) {
    if sender.send(event).is_err() {
        debug!(target: PARENT_TARGET, "tick reader already finished");
    }
}

/// Spawns `--serve`, runs the calls and waits for the child to exit.
pub(crate) fn run<W: Write>(cli: &Cli, config: &Config, out: &mut W) -> Result<(), DemoError> {
    let program = env::current_exe().map_err(DemoError::Spawn)?;
    let mut child = Command::new(program)
        .args(cli.child_arguments())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(DemoError::Spawn)?;
    info!(target: PARENT_TARGET, pid = child.id(), "spawned serving process");

    let outcome = converse(&mut child, cli, config, out);
    let status = child.wait().map_err(DemoError::Wait)?;
    outcome?;
    if status.success() {
        Ok(())
    } else {
        Err(DemoError::ChildFailed(status))
    }
}

fn converse<W: Write>(
    child: &mut Child,
    cli: &Cli,
    config: &Config,
    out: &mut W,
) -> Result<(), DemoError> {
    let stdin = child.stdin.take().ok_or(DemoError::MissingPipe("stdin"))?;
    let stdout = child.stdout.take().ok_or(DemoError::MissingPipe("stdout"))?;
    let info = ChannelInfo::new("child", Some(format!("pid:{}", child.id())));
    let port = Port::from_stream(info, stdout, stdin, config.max_frame_bytes());
    let client = Client::new(Link::new(port), config);

    let outcome = call_procedures(&client, cli, config, out);
    // Closing stdin is what tells the child to exit.
    client.link().close();
    outcome
}

fn call_procedures<W: Write>(
    client: &Client<Port>,
    cli: &Cli,
    config: &Config,
    out: &mut W,
) -> Result<(), DemoError> {
    let reply: EchoReply = client.query(
        "greeting.echo",
        &EchoRequest {
            message: cli.message.clone(),
        },
    )?;
    writeln!(out, "echo: {} (via {})", reply.message, reply.channel).map_err(DemoError::Output)?;

    let quotient: i64 = client.query(
        "math.divide",
        &DivideRequest {
            dividend: 84,
            divisor: 2,
        },
    )?;
    writeln!(out, "84 / 2 = {quotient}").map_err(DemoError::Output)?;

    let refused = client.query::<_, i64>(
        "math.divide",
        &DivideRequest {
            dividend: 1,
            divisor: 0,
        },
    );
    match refused {
        Ok(value) => writeln!(out, "1 / 0 = {value}"),
        Err(error) => writeln!(out, "1 / 0 failed: {error} ({})", error.code()),
    }
    .map_err(DemoError::Output)?;

    read_ticks(client, cli, config, out)
}

fn read_ticks<W: Write>(
    client: &Client<Port>,
    cli: &Cli,
    config: &Config,
    out: &mut W,
) -> Result<(), DemoError> {
    let (sender, receiver) = mpsc::channel();
    let on_data = sender.clone();
    let on_error = sender.clone();
    let callbacks = SubscriptionCallbacks::new(move |tick: u64| {
        forward(&on_data, TickEvent::Tick(tick));
    })
    .on_error(move |error| forward(&on_error, TickEvent::Failed(error)))
    .on_complete(move || forward(&sender, TickEvent::Ended));

    let handle = client.subscription(
        "clock.ticks",
        &TickRequest {
            interval_ms: cli.tick_interval_ms,
        },
        callbacks,
    )?;

    let mut received = 0;
    while received < cli.ticks {
        match receiver.recv_timeout(config.call_timeout()) {
            Ok(TickEvent::Tick(tick)) => {
                received += 1;
                writeln!(out, "tick {tick}").map_err(DemoError::Output)?;
            }
            Ok(TickEvent::Failed(error)) => {
                handle.unsubscribe();
                return Err(error.into());
            }
            Ok(TickEvent::Ended) | Err(_) => {
                handle.unsubscribe();
                return Err(DemoError::StreamEnded {
                    received,
                    expected: cli.ticks,
                });
            }
        }
    }
    handle.unsubscribe();
    writeln!(out, "unsubscribed after {received} ticks").map_err(DemoError::Output)
}
