//! maiplex: a framework for high-throughput TCP servers.
//!
//! One dedicated event-loop thread owns all socket I/O; a fixed worker pool
//! runs application-defined request processors. Responses fan out by
//! reference to any number of local clients and are forwarded to peer
//! servers holding clients connected elsewhere in the farm. The framework
//! handles the wire framing, the per-client request/response lifecycle,
//! keepalives and graceful shutdown.
//!
//! Applications implement [`Processor`] once per protocol version, register
//! the processors with [`Server::start`] and call [`Server::run`]:
//!
//! ```no_run
//! use maiplex::{Config, Processor, Registration, RequestContext, Server, VersionParams};
//! use maiplex::{ClientHandle, SessionData};
//!
//! struct Echo;
//!
//! impl Processor for Echo {
//!     fn clone_boxed(&self) -> Box<dyn Processor> {
//!         Box::new(Echo)
//!     }
//!
//!     fn process_request(&mut self, ctx: &mut RequestContext<'_>) -> bool {
//!         let sender = ctx.sender();
//!         let payload = ctx.payload().clone();
//!         ctx.send_response(sender, &payload);
//!         true
//!     }
//!
//!     fn process_disconnection(&mut self, _: ClientHandle, _: Option<SessionData>) {}
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load()?;
//! let registrations = vec![Registration::new(1, VersionParams::default(), Box::new(Echo))];
//! let server = Server::start(config, registrations)?;
//! server.run()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod dispatch;
pub mod fanout;
pub mod forwarded;
pub mod handle;
pub mod manager;
pub mod peer;
pub mod pool;
pub mod processor;
pub mod request;
pub mod response;
pub mod session;
pub mod sink;
pub mod stats;
pub mod wire;

pub use config::{CommonParams, Config, ConfigError, VersionParams};
pub use context::ControlHandle;
pub use handle::{ClientHandle, ServerAddr};
pub use manager::{Server, StartError};
pub use processor::{Processor, Registration, RequestContext};
pub use session::SessionData;
