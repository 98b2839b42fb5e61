//! maiplex server binary.
//!
//! Runs the framework with a version-1 echo processor, the smallest useful
//! application: whatever a client sends inside a frame comes back in a
//! frame. Standard input doubles as the runtime control surface: `s`
//! (or Ctrl+S) initiates graceful shutdown, `p` (or Ctrl+P) prints a status
//! snapshot.

use maiplex::{
    ClientHandle, Config, ControlHandle, Processor, Registration, RequestContext, Server,
    SessionData, VersionParams,
};
use std::io::Read;
use tracing::info;
use tracing_subscriber::EnvFilter;

struct EchoProcessor;

impl Processor for EchoProcessor {
    fn clone_boxed(&self) -> Box<dyn Processor> {
        Box::new(EchoProcessor)
    }

    fn process_request(&mut self, ctx: &mut RequestContext<'_>) -> bool {
        let sender = ctx.sender();
        let payload = ctx.payload().clone();
        ctx.send_response(sender, &payload);
        true
    }

    fn process_disconnection(&mut self, _handle: ClientHandle, _data: Option<SessionData>) {}
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        address = %config.address,
        port = config.port,
        workers = config.common.max_request_processing_threads,
        "starting maiplex server"
    );

    let registrations = vec![Registration::new(
        1,
        VersionParams::default(),
        Box::new(EchoProcessor),
    )];

    let server = Server::start(config, registrations)?;
    spawn_control_input(server.control());

    info!("press 'p' for a status snapshot, 's' to shut down");
    server.run()?;
    Ok(())
}

/// Feed console keystrokes into the runtime control handle.
fn spawn_control_input(control: ControlHandle) {
    let _ = std::thread::Builder::new()
        .name("control-input".to_string())
        .spawn(move || {
            for byte in std::io::stdin().lock().bytes() {
                match byte {
                    // Ctrl+S or 's' shuts down, Ctrl+P or 'p' prints status.
                    Ok(0x13) | Ok(b's') | Ok(b'S') => control.request_shutdown(),
                    Ok(0x10) | Ok(b'p') | Ok(b'P') => control.request_status(),
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        });
}
