//! Host-defined functions that run on the device: tasks, setup bodies,
//! background threads and teardown code.

use std::sync::OnceLock;

use belay_proto::{Shape, Value};
use regex::Regex;

use crate::device::{Device, ExecOptions, Reply};
use crate::error::{Error, Result};
use crate::minify::{Minifier, StripComments, dedent};
use crate::proxy::{call_args, check_identifier};
use crate::stream::Stream;
use crate::traceback::{SourceLocation, remap};

/// First top-level function definition.
#[allow(clippy::expect_used)]
fn def_name() -> &'static Regex {
    static CACHED: OnceLock<Regex> = OnceLock::new();
    CACHED.get_or_init(|| {
        Regex::new(r"(?m)^(?:async\s+)?def\s+([A-Za-z_]\w*)\s*\(").expect("def regex must compile")
    })
}

/// `yield` as a keyword.
#[allow(clippy::expect_used)]
fn yield_keyword() -> &'static Regex {
    static CACHED: OnceLock<Regex> = OnceLock::new();
    CACHED.get_or_init(|| Regex::new(r"\byield\b").expect("yield regex must compile"))
}

/// Dedents and strips comments, keeping line numbers.
fn prepare(source: &str) -> String {
    StripComments.minify(&dedent(source))
}

/// Rewrites the traceback of a failed call made on behalf of `name`.
fn remap_error(e: Error, name: &str, loc: &SourceLocation) -> Error {
    match e {
        Error::RemoteExecution { raw, .. } => Error::RemoteExecution {
            remapped: remap(&raw, name, loc),
            raw,
        },
        other => other,
    }
}

/// Renders `name(args, k=v)`.
fn call_expr(name: &str, args: &[Value], kwargs: &[(&str, Value)]) -> Result<String> {
    Ok(format!("{name}({})", call_args(args, kwargs)?))
}

/// A function defined on the device.
#[derive(Debug, Clone)]
pub struct Task {
    /// Device the function lives on.
    device: Device,
    /// Function name.
    name: String,
    /// The body contains `yield`.
    generator: bool,
    /// Host location of the source.
    location: SourceLocation,
}

impl Task {
    /// Function name on the device.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `true` for generator functions.
    pub const fn is_generator(&self) -> bool {
        self.generator
    }

    /// Calls the function and waits for its result. Not recorded.
    pub fn call(&self, args: &[Value]) -> Result<Reply> {
        self.call_with(args, &[])
    }

    /// Calls the function with keyword arguments.
    pub fn call_with(&self, args: &[Value], kwargs: &[(&str, Value)]) -> Result<Reply> {
        let expr = call_expr(&self.name, args, kwargs)?;
        self.device
            .run_with(&expr, &ExecOptions::expression())
            .map_err(|e| remap_error(e, &self.name, &self.location))
    }

    /// Iterates the values a generator task yields.
    pub fn stream(&self, args: &[Value]) -> Result<Stream<'_>> {
        if !self.generator {
            return Err(Error::InvalidArgument(format!("`{}` is not a generator", self.name)));
        }
        let expr = call_expr(&self.name, args, &[])?;
        let stream = self
            .device
            .stream(&expr)
            .map_err(|e| remap_error(e, &self.name, &self.location))?;
        Ok(stream.with_origin(self.name.clone(), self.location.clone()))
    }
}

/// A function started in a device thread.
#[derive(Debug, Clone)]
pub struct Thread {
    /// Device the function lives on.
    device: Device,
    /// Function name.
    name: String,
}

impl Thread {
    /// Function name on the device.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Starts the function in a new device thread without waiting for it.
    pub fn spawn(&self, args: &[Value]) -> Result<()> {
        let code = format!(
            "import _thread\n_thread.start_new_thread({}, {})",
            self.name,
            Value::Tuple(args.to_vec())
        );
        self.device.run_with(&code, &ExecOptions::statement()).map(drop)
    }
}

impl Device {
    /// Defines `source` (a single top-level `def`) on the device.
    ///
    /// The definition is recorded and replayed after a reconnect. `location`
    /// is where the source starts on the host, used to remap tracebacks.
    pub fn task(&self, source: &str, location: SourceLocation) -> Result<Task> {
        let code = prepare(source);
        let name = def_name()
            .captures(&code)
            .map(|c| c[1].to_owned())
            .ok_or_else(|| Error::InvalidArgument("source does not define a function".to_owned()))?;
        let generator = yield_keyword().is_match(&code);
        tracing::debug!(%name, generator, "defining task");
        self.run_with(&code, &ExecOptions::default().with_shape(Shape::Statement))
            .map_err(|e| remap_error(e, &name, &location))?;
        Ok(Task {
            device: self.clone(),
            name,
            generator,
            location,
        })
    }

    /// Runs `source` at module level with `args` bound as globals.
    ///
    /// Recorded, so it is replayed after a reconnect.
    pub fn setup(&self, source: &str, args: &[(&str, Value)], location: SourceLocation) -> Result<()> {
        let body = prepare(source);
        let mut code = String::new();
        let mut loc = location;
        if !args.is_empty() {
            let mut bindings = Vec::with_capacity(args.len());
            for (name, value) in args {
                check_identifier(name)?;
                bindings.push(format!("{name} = {value}"));
            }
            code.push_str(&bindings.join("; "));
            code.push('\n');
            loc.line = loc.line.saturating_sub(1);
        }
        code.push_str(&body);
        self.run_with(&code, &ExecOptions::default().with_shape(Shape::Statement))
            .map(drop)
            .map_err(|e| remap_error(e, "<module>", &loc))
    }

    /// Defines a function to be started in device threads.
    ///
    /// Fails with [`Error::FeatureUnavailable`] on firmware without `_thread`.
    pub fn thread(&self, source: &str, location: SourceLocation) -> Result<Thread> {
        let threads = self
            .implementation()
            .is_some_and(|imp| imp.dispatch().threads);
        if !threads {
            return Err(Error::FeatureUnavailable("_thread".to_owned()));
        }
        let task = self.task(source, location)?;
        Ok(Thread {
            device: task.device,
            name: task.name,
        })
    }

    /// Registers code that [`Device::close`] runs before closing the transport.
    pub fn teardown(&self, source: &str) {
        let code = prepare(source);
        self.register_teardown(code);
    }
}
