//! Entry point for the portlink demo.

use std::io;
use std::process::ExitCode;

fn main() -> ExitCode {
    // Unlocked handles: `--serve` writes frames to stdout and logs to
    // stderr from other threads.
    let mut stdout = io::stdout();
    let mut stderr = io::stderr();
    portlink_demo::run(std::env::args_os(), &mut stdout, &mut stderr)
}
