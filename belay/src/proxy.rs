//! Host-side handles onto objects that live on the device.

use belay_proto::Value;

use crate::device::{Device, ExecOptions, Reply};
use crate::error::{Error, Result};
use crate::stream::Stream;

/// Handle onto a device object.
///
/// Every operation is sent as a fresh expression. Literal results come back
/// by value; anything else comes back as a nested handle. An owning handle
/// deletes its device reference when dropped, unless the session has been
/// disconnected or reconnected since the handle was created.
#[derive(Debug)]
pub struct ProxyHandle {
    /// Device the object lives on.
    device: Device,
    /// Device-side expression naming the object.
    target: String,
    /// Reference id for handles that own a device reference.
    ref_id: Option<u64>,
    /// Session epoch the handle was created in.
    epoch: u64,
}

impl ProxyHandle {
    /// Handle onto `__belay_obj_<id>`; deleted on drop.
    pub(crate) fn owned(device: Device, id: u64, epoch: u64) -> Self {
        Self {
            device,
            target: format!("__belay_obj_{id}"),
            ref_id: Some(id),
            epoch,
        }
    }

    /// Handle onto an existing expression; nothing is deleted on drop.
    pub(crate) fn borrowed(device: Device, target: String) -> Self {
        let epoch = device.epoch();
        Self {
            device,
            target,
            ref_id: None,
            epoch,
        }
    }

    /// Device-side expression naming the object. Usable inside code passed
    /// to [`Device::run`].
    pub fn name(&self) -> &str {
        &self.target
    }

    /// Reference id, for owning handles.
    pub const fn ref_id(&self) -> Option<u64> {
        self.ref_id
    }

    /// Returns `true` if dropping the handle deletes the device reference.
    pub const fn is_owning(&self) -> bool {
        self.ref_id.is_some()
    }

    /// Evaluates an expression built from this handle.
    fn eval(&self, expr: &str) -> Result<Reply> {
        self.device.run_with(expr, &ExecOptions::expression())
    }

    /// Runs a statement built from this handle.
    fn exec(&self, code: &str) -> Result<()> {
        self.device.run_with(code, &ExecOptions::statement()).map(drop)
    }

    /// `obj.attr`
    pub fn get(&self, attr: &str) -> Result<Reply> {
        check_identifier(attr)?;
        self.eval(&format!("{}.{attr}", self.target))
    }

    /// `obj.attr = value`
    pub fn set(&self, attr: &str, value: impl Into<Value>) -> Result<()> {
        check_identifier(attr)?;
        self.exec(&format!("{}.{attr} = {}", self.target, value.into()))
    }

    /// `obj[key]`
    pub fn index(&self, key: impl Into<Value>) -> Result<Reply> {
        self.eval(&format!("{}[{}]", self.target, key.into()))
    }

    /// `obj[key] = value`
    pub fn set_index(&self, key: impl Into<Value>, value: impl Into<Value>) -> Result<()> {
        self.exec(&format!("{}[{}] = {}", self.target, key.into(), value.into()))
    }

    /// `obj(*args, **kwargs)`
    pub fn call(&self, args: &[Value], kwargs: &[(&str, Value)]) -> Result<Reply> {
        self.eval(&format!("{}({})", self.target, call_args(args, kwargs)?))
    }

    /// `obj.name(*args, **kwargs)`
    pub fn method(&self, name: &str, args: &[Value], kwargs: &[(&str, Value)]) -> Result<Reply> {
        check_identifier(name)?;
        self.eval(&format!("{}.{name}({})", self.target, call_args(args, kwargs)?))
    }

    /// `len(obj)`
    pub fn length(&self) -> Result<usize> {
        let value = self.eval(&format!("len({})", self.target))?.into_value()?;
        value
            .as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| Error::InvalidArgument(format!("len() returned {value}")))
    }

    /// `value in obj`
    pub fn contains(&self, value: impl Into<Value>) -> Result<bool> {
        let found = self
            .eval(&format!("{} in {}", value.into(), self.target))?
            .into_value()?;
        found
            .as_bool()
            .ok_or_else(|| Error::InvalidArgument(format!("`in` returned {found}")))
    }

    /// `iter(obj)`, one value at a time.
    pub fn iterate(&self) -> Result<Stream<'_>> {
        self.device.stream(&self.target)
    }
}

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        if let Some(id) = self.ref_id {
            self.device.release(id, self.epoch);
        }
    }
}

/// Renders a call argument list.
pub(crate) fn call_args(args: &[Value], kwargs: &[(&str, Value)]) -> Result<String> {
    let mut parts: Vec<String> = args.iter().map(ToString::to_string).collect();
    for (name, value) in kwargs {
        check_identifier(name)?;
        parts.push(format!("{name}={value}"));
    }
    Ok(parts.join(", "))
}

/// Rejects anything that is not a plain identifier.
pub(crate) fn check_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c == '_' || c.is_alphabetic())
        && chars.all(|c| c == '_' || c.is_alphanumeric());
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!("`{name}` is not an identifier")))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::Config;
    use crate::transport::emulator::{Emulator, EmulatorHandle, Reply as Out, expression_of};

    fn device() -> (Device, EmulatorHandle) {
        let (emu, handle) = Emulator::new();
        let config = Config::default()
            .with_read_timeout(Duration::from_millis(50))
            .with_sync_time(false);
        (Device::connect(emu, config).unwrap(), handle)
    }

    fn make_obj(dev: &Device, emu: &EmulatorHandle) -> ProxyHandle {
        emu.respond(|code| match expression_of(code) {
            Some("Pin(25)") => Some(Out::reference(1)),
            Some("__belay_obj_1.value") => Some(Out::value("0")),
            Some("__belay_obj_1.irq") => Some(Out::reference(2)),
            Some("len(__belay_obj_1)") => Some(Out::value("3")),
            Some("5 in __belay_obj_1") => Some(Out::value("True")),
            Some("__belay_obj_1(1, mode='out')") => Some(Out::value("'ok'")),
            _ => None,
        });
        dev.run("Pin(25)").unwrap().into_proxy().unwrap()
    }

    #[test]
    fn forwards_operations() {
        let (dev, emu) = device();
        let pin = make_obj(&dev, &emu);
        assert_eq!(pin.name(), "__belay_obj_1");
        assert_eq!(pin.get("value").unwrap().into_value().unwrap(), Value::Int(0));
        assert_eq!(pin.length().unwrap(), 3);
        assert!(pin.contains(5).unwrap());
        let out = pin
            .call(&[Value::Int(1)], &[("mode", Value::from("out"))])
            .unwrap();
        assert_eq!(out.into_value().unwrap(), Value::from("ok"));
        pin.set("value", 1).unwrap();
        pin.set_index(0, "x").unwrap();
        let log = emu.log();
        assert!(log.contains(&"__belay_obj_1.value = 1".to_owned()));
        assert!(log.contains(&"__belay_obj_1[0] = 'x'".to_owned()));
    }

    #[test]
    fn non_literals_become_nested_handles() {
        let (dev, emu) = device();
        let pin = make_obj(&dev, &emu);
        let irq = pin.get("irq").unwrap().into_proxy().unwrap();
        assert_eq!(irq.ref_id(), Some(2));
    }

    #[test]
    fn drop_while_connected_deletes_once() {
        let (dev, emu) = device();
        let pin = make_obj(&dev, &emu);
        emu.clear_log();
        drop(pin);
        assert_eq!(emu.log(), vec!["del __belay_obj_1"]);
    }

    #[test]
    fn drop_while_disconnected_sends_nothing() {
        let (dev, emu) = device();
        let pin = make_obj(&dev, &emu);
        emu.unplug();
        assert!(dev.run("a = 1").is_err());
        emu.clear_log();
        drop(pin);
        assert!(emu.log().is_empty());
    }

    #[test]
    fn handles_from_before_a_reconnect_are_inert() {
        let (dev, emu) = device();
        let pin = make_obj(&dev, &emu);
        dev.reconnect().unwrap();
        emu.clear_log();
        drop(pin);
        dev.run("b = 1").unwrap();
        assert_eq!(emu.log(), vec!["b = 1"]);
    }

    #[test]
    fn drops_during_a_stream_are_flushed_later() {
        let (dev, emu) = device();
        emu.respond(|code| match expression_of(code) {
            Some("objs()") => Some(Out::stdout("_BELAYR4||\r\n_BELAYR5||\r\n_BELAYS\r\n")),
            _ => None,
        });
        let mut stream = dev.stream("objs()").unwrap();
        drop(stream.next().unwrap().unwrap());
        drop(stream.next().unwrap().unwrap());
        assert!(stream.next().is_none());
        drop(stream);
        emu.clear_log();
        dev.run("c = 1").unwrap();
        assert_eq!(emu.log(), vec!["del __belay_obj_4, __belay_obj_5", "c = 1"]);
    }

    #[test]
    fn borrowed_handles_never_delete() {
        let (dev, emu) = device();
        let led = dev.proxy("led");
        emu.clear_log();
        drop(led);
        dev.run("d = 1").unwrap();
        assert_eq!(emu.log(), vec!["d = 1"]);
    }

    #[test]
    fn identifiers_are_checked() {
        let (dev, _emu) = device();
        let led = dev.proxy("led");
        assert!(matches!(led.get("on()"), Err(Error::InvalidArgument(_))));
        assert!(check_identifier("_ok1").is_ok());
        assert!(check_identifier("1bad").is_err());
    }
}
