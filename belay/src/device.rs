//! The public device handle.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::SystemTime;

use belay_proto::{ResultLine, Shape, Value, decode, wrap_expression, wrap_stream};
use parking_lot::{Mutex, MutexGuard};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::implementation::Implementation;
use crate::proxy::ProxyHandle;
use crate::session::{LinkState, Session, Status};
use crate::stream::Stream;
use crate::transport::Transport;

/// How a command is sent and whether it becomes part of the session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct ExecOptions {
    /// Statement, expression, or detect.
    pub shape: Shape,
    /// Decode results with the trusted evaluator.
    ///
    /// The trusted evaluator accepts arithmetic and builtin constructor calls
    /// in device output. Only enable it for devices you control.
    pub trusted: bool,
    /// Record the command for replay after a reconnect.
    pub record: bool,
    /// Ask the device to timestamp results.
    pub timed: bool,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            shape: Shape::Auto,
            trusted: false,
            record: true,
            timed: false,
        }
    }
}

impl ExecOptions {
    /// Options for a fire-and-forget expression that is not replayed.
    pub fn expression() -> Self {
        Self {
            shape: Shape::Expression,
            record: false,
            ..Self::default()
        }
    }

    /// Options for a statement that is not replayed.
    pub fn statement() -> Self {
        Self {
            shape: Shape::Statement,
            record: false,
            ..Self::default()
        }
    }

    /// Sets the command shape.
    pub const fn with_shape(mut self, shape: Shape) -> Self {
        self.shape = shape;
        self
    }

    /// Enables the trusted result evaluator.
    pub const fn with_trusted(mut self, trusted: bool) -> Self {
        self.trusted = trusted;
        self
    }

    /// Sets whether the command is replayed after a reconnect.
    pub const fn with_record(mut self, record: bool) -> Self {
        self.record = record;
        self
    }

    /// Requests device timestamps.
    pub const fn with_timed(mut self, timed: bool) -> Self {
        self.timed = timed;
        self
    }
}

/// A returned value: a literal copied to the host, or a handle onto an
/// object that stayed on the device.
#[derive(Debug)]
#[non_exhaustive]
pub enum Payload {
    /// Literal value.
    Value(Value),
    /// Remote object.
    Proxy(ProxyHandle),
}

/// Result of a command.
#[derive(Debug)]
pub struct Reply {
    /// Returned value.
    payload: Payload,
    /// Device tick count when the value was produced.
    timestamp_ms: Option<u64>,
}

impl Reply {
    /// A reply carrying `None`.
    pub(crate) const fn none() -> Self {
        Self {
            payload: Payload::Value(Value::None),
            timestamp_ms: None,
        }
    }

    /// The returned value.
    pub const fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Consumes the reply, returning the value.
    pub fn into_payload(self) -> Payload {
        self.payload
    }

    /// The literal value, if the result was a literal.
    pub const fn value(&self) -> Option<&Value> {
        match &self.payload {
            Payload::Value(v) => Some(v),
            Payload::Proxy(_) => None,
        }
    }

    /// Consumes the reply, requiring a literal.
    pub fn into_value(self) -> Result<Value> {
        match self.payload {
            Payload::Value(v) => Ok(v),
            Payload::Proxy(p) => Err(Error::InvalidArgument(format!(
                "result is a remote object ({})",
                p.name()
            ))),
        }
    }

    /// Consumes the reply, returning the remote object handle if there is one.
    pub fn into_proxy(self) -> Option<ProxyHandle> {
        match self.payload {
            Payload::Proxy(p) => Some(p),
            Payload::Value(_) => None,
        }
    }

    /// Device tick count (ms) for timed commands.
    pub const fn timestamp(&self) -> Option<u64> {
        self.timestamp_ms
    }
}

/// Shared state behind every [`Device`] clone.
#[derive(Debug)]
struct Shared {
    /// Session; held for the duration of one command.
    session: Mutex<Session>,
    /// Lock-free session facts.
    status: Arc<Status>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Err(e) = self.session.get_mut().close() {
            tracing::debug!(error = %e, "closing device on drop failed");
        }
    }
}

/// Handle onto a device running MicroPython or CircuitPython.
///
/// Clones share one session; commands from different clones are serialized.
/// A [`Stream`] holds the session until it is exhausted or dropped, so other
/// calls on the same thread must wait until then.
#[derive(Debug, Clone)]
pub struct Device {
    /// Shared session.
    shared: Arc<Shared>,
}

impl Device {
    /// Opens `transport`, enters the raw REPL and prepares the device.
    pub fn connect(transport: impl Transport + 'static, config: Config) -> Result<Self> {
        let status = Arc::new(Status::default());
        let mut session = Session::new(Box::new(transport), config, Arc::clone(&status));
        session.connect()?;
        Ok(Self {
            shared: Arc::new(Shared {
                session: Mutex::new(session),
                status,
            }),
        })
    }

    /// Locks the session, reconnecting and flushing queued deletes first.
    pub(crate) fn session(&self) -> Result<MutexGuard<'_, Session>> {
        let mut session = self.shared.session.lock();
        session.ensure_ready()?;
        session.flush_deletes();
        session.ensure_ready()?;
        Ok(session)
    }

    /// Current proxy epoch.
    pub(crate) fn epoch(&self) -> u64 {
        self.shared.status.epoch.load(Ordering::SeqCst)
    }

    /// Queues code for [`Self::close`].
    pub(crate) fn register_teardown(&self, code: String) {
        self.shared.session.lock().teardown.push(code);
    }

    /// Turns a result line into a reply.
    pub(crate) fn reply(&self, line: ResultLine, trusted: bool) -> Result<Reply> {
        let payload = match line.ref_id {
            Some(id) => Payload::Proxy(ProxyHandle::owned(self.clone(), id, self.epoch())),
            None => Payload::Value(decode(&line.payload, trusted)?),
        };
        Ok(Reply {
            payload,
            timestamp_ms: line.timestamp_ms,
        })
    }

    /// Queues a delete for a dropped remote reference and sends it if the
    /// session is idle.
    pub(crate) fn release(&self, id: u64, epoch: u64) {
        let status = &self.shared.status;
        if status.closed.load(Ordering::SeqCst)
            || !status.connected.load(Ordering::SeqCst)
            || status.epoch.load(Ordering::SeqCst) != epoch
        {
            return;
        }
        status.deletes.lock().push((epoch, id));
        if let Some(mut session) = self.shared.session.try_lock() {
            session.flush_deletes();
        }
    }

    /// Runs `code`, detecting whether it is an expression, and records it
    /// for replay.
    pub fn run(&self, code: &str) -> Result<Reply> {
        self.run_with(code, &ExecOptions::default())
    }

    /// Runs `code` with explicit options.
    ///
    /// Expressions reply with their value; statements reply with `None`
    /// unless they print a result line themselves.
    pub fn run_with(&self, code: &str, opts: &ExecOptions) -> Result<Reply> {
        let text = if opts.shape.resolve(code) == Shape::Expression {
            wrap_expression(code, opts.timed, opts.trusted)
        } else {
            code.to_owned()
        };
        let results = self.session()?.execute_as(&text, opts.record, opts.trusted)?;
        match results.into_iter().last() {
            Some(line) => self.reply(line, opts.trusted),
            None => Ok(Reply::none()),
        }
    }

    /// Evaluates an expression that must produce a literal. Not recorded.
    pub fn eval(&self, expr: &str) -> Result<Value> {
        self.run_with(expr, &ExecOptions::expression())?.into_value()
    }

    /// Iterates the values produced by an iterable expression on the device.
    pub fn stream(&self, expr: &str) -> Result<Stream<'_>> {
        self.stream_with(expr, &ExecOptions::expression())
    }

    /// [`Self::stream`] with explicit decoding options.
    pub fn stream_with(&self, expr: &str, opts: &ExecOptions) -> Result<Stream<'_>> {
        let mut session = self.session()?;
        session.begin(&wrap_stream(expr, opts.timed, opts.trusted))?;
        Ok(Stream::new(self, session, opts.trusted))
    }

    /// A handle onto an existing device global. Dropping it deletes nothing.
    pub fn proxy(&self, expr: impl Into<String>) -> ProxyHandle {
        ProxyHandle::borrowed(self.clone(), expr.into())
    }

    /// Re-estimates the device clock offset; returns it in seconds.
    pub fn sync_time(&self, samples: usize) -> Result<f64> {
        self.session()?.sync_time(samples)
    }

    /// Converts a device timestamp to host time, once an offset is known.
    pub fn host_time(&self, device_ms: u64) -> Option<SystemTime> {
        self.shared.session.lock().host_time(device_ms)
    }

    /// `device_seconds - host_seconds`, once estimated.
    pub fn clock_offset(&self) -> Option<f64> {
        self.shared.session.lock().time_offset()
    }

    /// Firmware detected on the current connection.
    pub fn implementation(&self) -> Option<Implementation> {
        self.shared.session.lock().implementation.clone()
    }

    /// Connection state.
    pub fn state(&self) -> LinkState {
        self.shared.session.lock().link()
    }

    /// Transport description.
    pub fn describe(&self) -> String {
        self.shared.session.lock().describe()
    }

    /// Number of commands that would be replayed on reconnect.
    pub fn history_len(&self) -> usize {
        self.shared.session.lock().history_len()
    }

    /// Receives program output that is not a result line. By default such
    /// lines are logged under the `belay::output` target.
    pub fn set_output(&self, sink: impl FnMut(&str) + Send + 'static) {
        self.shared.session.lock().set_output(Some(Box::new(sink)));
    }

    /// Reconnects now and replays history, even if reconnecting is disabled.
    pub fn reconnect(&self) -> Result<()> {
        self.shared.session.lock().reconnect(true)
    }

    /// Runs teardown code and closes the transport. Later calls fail with
    /// [`Error::Closed`].
    pub fn close(&self) -> Result<()> {
        self.shared.session.lock().close()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::transport::emulator::{Emulator, EmulatorHandle, Reply as Out, expression_of};

    fn config() -> Config {
        Config::default()
            .with_read_timeout(Duration::from_millis(50))
            .with_reconnect_delay(Duration::ZERO)
            .with_sync_time(false)
    }

    fn device(config: Config) -> (Device, EmulatorHandle) {
        let (emu, handle) = Emulator::new();
        let device = Device::connect(emu, config).unwrap();
        handle.clear_log();
        (device, handle)
    }

    #[test]
    fn expressions_return_values() {
        let (dev, emu) = device(config());
        emu.respond(|code| (expression_of(code) == Some("1 + 1")).then(|| Out::value("2")));
        assert_eq!(dev.eval("1 + 1").unwrap(), Value::Int(2));
        assert_eq!(dev.history_len(), 0);
    }

    #[test]
    fn statements_are_recorded() {
        let (dev, emu) = device(config());
        let reply = dev.run("x = 5").unwrap();
        assert_eq!(reply.value(), Some(&Value::None));
        assert_eq!(emu.log(), vec!["x = 5"]);
        assert_eq!(dev.history_len(), 1);
    }

    #[test]
    fn trusted_results() {
        let (dev, emu) = device(config());
        emu.respond(|code| expression_of(code).map(|_| Out::value("float('inf')")));
        assert!(dev.eval("math.inf").is_err());
        let v = dev
            .run_with("math.inf", &ExecOptions::expression().with_trusted(true))
            .unwrap()
            .into_value()
            .unwrap();
        assert_eq!(v.as_f64(), Some(f64::INFINITY));
    }

    #[test]
    fn timed_results_carry_timestamps() {
        let (dev, emu) = device(config());
        emu.respond(|code| code.ends_with(", 1, 0)").then(|| Out::timed_value("3", 1234)));
        let reply = dev
            .run_with("read()", &ExecOptions::expression().with_timed(true))
            .unwrap();
        assert_eq!(reply.timestamp(), Some(1234));
    }

    #[test]
    fn remote_exceptions_keep_session() {
        let (dev, emu) = device(config());
        emu.respond(|code| {
            (code == "raise ValueError").then(|| Out::error("ValueError:\r\n"))
        });
        let err = dev.run("raise ValueError").unwrap_err();
        assert!(matches!(err, Error::RemoteExecution { .. }));
        assert_eq!(dev.state(), LinkState::Connected);
    }

    #[test]
    fn zero_attempts_fail_at_once() {
        let (dev, emu) = device(config());
        emu.unplug();
        assert!(dev.run("a = 1").unwrap_err().is_disconnect());
        assert_eq!(dev.state(), LinkState::Disconnected);
        let opens = emu.opens();
        assert!(matches!(dev.run("a = 1"), Err(Error::ConnectionLost)));
        assert_eq!(emu.opens(), opens);
    }

    #[test]
    fn reconnect_budget_is_bounded() {
        let (dev, emu) = device(config().with_attempts(3));
        emu.unplug();
        emu.set_reachable(false);
        dev.run("a = 1").unwrap_err();
        let opens = emu.opens();
        assert!(matches!(dev.run("a = 1"), Err(Error::ConnectionLost)));
        assert_eq!(emu.opens() - opens, 3);
        assert_eq!(dev.state(), LinkState::Disconnected);
    }

    #[test]
    fn negative_budget_retries_until_reachable() {
        let (dev, emu) = device(config().with_attempts(-1));
        emu.unplug();
        dev.run("a = 1").unwrap_err();
        let opens = emu.opens();
        let (tx, rx) = std::sync::mpsc::channel();
        emu.set_reachable(false);
        let waiter = emu.clone();
        let handle = std::thread::spawn(move || {
            while waiter.opens() < opens + 5 {
                std::thread::yield_now();
            }
            waiter.set_reachable(true);
            tx.send(()).unwrap();
        });
        dev.run("b = 2").unwrap();
        rx.recv().unwrap();
        handle.join().unwrap();
        assert!(emu.opens() - opens >= 6);
        assert_eq!(dev.state(), LinkState::Connected);
    }

    #[test]
    fn replays_history_in_order() {
        let (dev, emu) = device(config().with_attempts(2));
        for i in 0..4 {
            dev.run(&format!("v{i} = {i}")).unwrap();
        }
        dev.eval("v0").unwrap();
        emu.unplug();
        dev.run("w = 1").unwrap_err();
        emu.clear_log();
        dev.run("z = 9").unwrap();
        let log = emu.log();
        let user: Vec<&String> = log
            .iter()
            .filter(|c| c.starts_with('v') || c.starts_with('z'))
            .collect();
        assert_eq!(user, vec!["v0 = 0", "v1 = 1", "v2 = 2", "v3 = 3", "z = 9"]);
        assert!(log[0].contains("def __belay_ret"));
        assert!(log[0].ends_with("__belay_ref_n = 0\n"));
    }

    #[test]
    fn replay_failure_is_connection_lost() {
        let (dev, emu) = device(config().with_attempts(1));
        dev.run("setup()").unwrap();
        emu.unplug();
        dev.run("a = 1").unwrap_err();
        emu.respond(|code| {
            (expression_of(code) == Some("setup()")).then(|| Out::error("OSError\r\n"))
        });
        assert!(matches!(dev.run("b = 2"), Err(Error::ConnectionLost)));
        assert_eq!(dev.state(), LinkState::Disconnected);
    }

    #[test]
    fn forced_reconnect_replays_and_bumps_epoch() {
        let (dev, emu) = device(config());
        dev.run("a = 1").unwrap();
        let epoch = dev.epoch();
        emu.clear_log();
        dev.reconnect().unwrap();
        assert_eq!(dev.epoch(), epoch + 1);
        assert!(emu.log().iter().any(|c| c == "a = 1"));
    }

    #[test]
    fn reference_counter_survives_reconnect() {
        let (dev, emu) = device(config());
        emu.respond(|code| (expression_of(code) == Some("obj()")).then(|| Out::reference(7)));
        let proxy = dev.run_with("obj()", &ExecOptions::expression()).unwrap();
        assert!(proxy.into_proxy().is_some());
        emu.clear_log();
        dev.reconnect().unwrap();
        assert!(emu.log()[0].ends_with("__belay_ref_n = 7\n"));
    }

    #[test]
    fn closed_device_rejects_calls() {
        let (dev, _emu) = device(config());
        dev.close().unwrap();
        assert!(matches!(dev.run("a = 1"), Err(Error::Closed)));
        assert_eq!(dev.state(), LinkState::Closed);
    }

    #[test]
    fn output_sink_gets_prints() {
        let (dev, emu) = device(config());
        emu.respond(|code| {
            (expression_of(code) == Some("print('hi')")).then(|| Out::stdout("hi\r\n"))
        });
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        dev.set_output(move |l| sink.lock().push(l.to_owned()));
        let reply = dev.run("print('hi')").unwrap();
        assert_eq!(reply.value(), Some(&Value::None));
        assert_eq!(*lines.lock(), vec!["hi"]);
    }

    #[test]
    fn output_sink_gets_statement_prints() {
        let (dev, emu) = device(config());
        let code = "for i in range(2):\n    print(i)";
        emu.respond(move |sent| (sent == code).then(|| Out::stdout("0\r\n1\r\n")));
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        dev.set_output(move |l| sink.lock().push(l.to_owned()));
        dev.run(code).unwrap();
        assert_eq!(*lines.lock(), vec!["0", "1"]);
    }
}
