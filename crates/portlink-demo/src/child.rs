//! `--serve` mode: answers requests on stdin and stdout.

use std::io;
use std::sync::Arc;
use std::sync::mpsc;

use portlink::{Channel, ChannelInfo, ErrorDetails, ErrorReporter, Handler, HandlerOptions, Port};
use portlink_config::Config;
use tracing::{debug, info, warn};

use crate::DemoError;
use crate::procedures::{self, DemoContext};

const CHILD_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::child");
const PARENT_ORIGIN: &str = "portlink-demo://parent";

/// Logs every failed call.
struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, details: &ErrorDetails) {
        warn!(
            target: CHILD_TARGET,
            path = details.path.as_deref().unwrap_or("<unknown>"),
            code = %details.error.code(),
            channel = %details.channel,
            reason = details.error.message(),
            "call failed"
        );
    }
}

/// Serves the demo router until the parent closes stdin.
pub(crate) fn serve(config: &Config) -> Result<(), DemoError> {
    let info = ChannelInfo::new("stdio", Some(PARENT_ORIGIN.to_owned()));
    let port = Port::from_stream(info, io::stdin(), io::stdout(), config.max_frame_bytes());
    let options = HandlerOptions::new(procedures::router(), DemoContext::from_channel)
        .accept_channel(|channel| channel.origin() == Some(PARENT_ORIGIN))
        .on_error(LogReporter);
    let connection = Handler::new(options)
        .attach_channel(port.clone())
        .ok_or(DemoError::Refused)?;

    // Registered after the handler's own listener, so the connection has
    // released its streams by the time this fires.
    let (hung_up, hang_up) = mpsc::channel();
    port.add_disconnect_listener(Arc::new(move || {
        if hung_up.send(()).is_err() {
            debug!(target: CHILD_TARGET, "serve loop already returned");
        }
    }));

    info!(target: CHILD_TARGET, channel = %connection.info(), "serving");
    if port.is_connected() && hang_up.recv().is_err() {
        debug!(target: CHILD_TARGET, "disconnect listener dropped");
    }
    info!(target: CHILD_TARGET, closed = connection.is_closed(), "parent hung up");
    Ok(())
}
