//! Drive MicroPython and CircuitPython devices from a host program.
//!
//! `belay` talks to the device's raw REPL over any byte [`Transport`].
//! Host code sends Python snippets, gets typed results back, keeps handles
//! onto device objects, and mirrors project directories onto the device
//! filesystem.
//!
//! # Quick start
//!
//! ```no_run
//! use belay::{Config, Device, TcpTransport, Value};
//!
//! let dev = Device::connect(TcpTransport::new("192.168.4.1:23"), Config::default())?;
//! dev.run("from machine import Pin\nled = Pin(25, Pin.OUT)")?;
//! dev.run("led.on()")?;
//! assert_eq!(dev.eval("1 + 1")?, Value::Int(2));
//! # Ok::<(), belay::Error>(())
//! ```
//!
//! Commands that change device state are recorded. If the link drops, the
//! next command reconnects (within [`Config::attempts`]) and replays them so
//! the device ends up where the host left it.

mod config;
mod device;
mod error;
mod history;
mod implementation;
mod minify;
mod proxy;
mod repl;
mod session;
mod stream;
pub mod sync;
mod task;
mod traceback;
mod transport;

pub use belay_proto::{Shape, Value};
pub use config::Config;
pub use device::{Device, ExecOptions, Payload, Reply};
pub use error::{Error, Result};
pub use history::{CallHistory, Command};
pub use implementation::{Arch, Dispatch, Emitters, Implementation, Kind};
pub use minify::{Minifier, StripComments};
pub use proxy::ProxyHandle;
pub use repl::{ReplController, ReplState};
pub use session::{LinkState, OutputSink};
pub use stream::Stream;
pub use sync::{HashRoutine, KeepPolicy, SyncEvent, SyncOptions, SyncPlan, SyncReport};
pub use task::{Task, Thread};
pub use traceback::{SourceLocation, remap};
pub use transport::{ProcessTransport, TcpTransport, Transport};
