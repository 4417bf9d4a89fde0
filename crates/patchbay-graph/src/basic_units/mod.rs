//! A plugin host with a handful of built-in units.

mod constant;
mod gain;
mod osc;
mod thru;

use ahash::AHashMap;

use patchbay_core::node::{Instance, InstantiateInfo, PluginHost};

pub use constant::ConstUnit;
pub use gain::GainUnit;
pub use osc::OscUnit;
pub use thru::ThruUnit;

type Factory = Box<dyn FnMut(&InstantiateInfo) -> Option<Instance> + Send>;

/// Instantiates the built-in units, plus any plugins registered with
/// [`BuiltinHost::register`].
///
/// | plugin              | ports                                      |
/// |---------------------|--------------------------------------------|
/// | `gen:osc`           | `freq` (control in, 440), `out` (audio)    |
/// | `gen:const`         | `value` (control in), `out` (audio)        |
/// | `fx:gain`           | `in` (audio), `gain` (control in, 1), `out`|
/// | `util:control_thru` | `in`, `out` (control)                      |
/// | `util:message_thru` | `in`, `out` (control, message context)     |
#[derive(Default)]
pub struct BuiltinHost {
    registered: AHashMap<String, Factory>,
}

impl BuiltinHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an additional plugin. A registered plugin shadows a
    /// built-in one with the same identifier.
    pub fn register(
        &mut self,
        plugin: &str,
        factory: impl FnMut(&InstantiateInfo) -> Option<Instance> + Send + 'static,
    ) {
        self.registered
            .insert(plugin.to_string(), Box::new(factory));
    }
}

impl PluginHost for BuiltinHost {
    fn instantiate(&mut self, info: &InstantiateInfo) -> Option<Instance> {
        if let Some(factory) = self.registered.get_mut(info.plugin) {
            return factory(info);
        }

        let instance = match info.plugin {
            OscUnit::PLUGIN => OscUnit::instantiate(info),
            ConstUnit::PLUGIN => ConstUnit::instantiate(info),
            GainUnit::PLUGIN => GainUnit::instantiate(info),
            ThruUnit::CONTROL_PLUGIN => ThruUnit::instantiate(info, false),
            ThruUnit::MESSAGE_PLUGIN => ThruUnit::instantiate(info, true),
            _ => {
                log::warn!("unknown plugin {:?}", info.plugin);
                return None;
            }
        };

        Some(instance)
    }
}

#[cfg(test)]
mod tests {
    use patchbay_core::{
        node::{PortDirection, ProcInfo, StreamStatus},
        Buffer, Path, PortType,
    };

    use super::*;

    fn info<'a>(plugin: &'a str, path: &'a Path, polyphony: u32) -> InstantiateInfo<'a> {
        InstantiateInfo {
            plugin,
            path,
            polyphony,
            sample_rate: 48000,
            cycle_size: 8,
        }
    }

    fn proc_info(frames: usize) -> ProcInfo {
        ProcInfo {
            frames,
            cycle_start: 0,
            sample_rate: 48000,
            stream_status: StreamStatus::empty(),
        }
    }

    #[test]
    fn unknown_plugins_fail() {
        let path = Path::new("/main/x").unwrap();
        let mut host = BuiltinHost::new();

        assert!(host.instantiate(&info("gen:nope", &path, 1)).is_none());
        assert!(host.instantiate(&info("gen:osc", &path, 1)).is_some());
    }

    #[test]
    fn gain_scales_its_input() {
        let path = Path::new("/main/gain").unwrap();
        let mut host = BuiltinHost::new();
        let mut instance = host.instantiate(&info("fx:gain", &path, 1)).unwrap();

        let symbols: Vec<(&str, PortDirection)> = instance
            .ports
            .iter()
            .map(|p| (p.symbol.as_str(), p.direction))
            .collect();
        assert_eq!(
            symbols,
            vec![
                ("in", PortDirection::Input),
                ("gain", PortDirection::Input),
                ("out", PortDirection::Output),
            ]
        );

        let mut input = Buffer::new(PortType::Audio, 8);
        input.set_value(0.5, 0);
        let mut gain = Buffer::new(PortType::Control, 1);
        gain.set_value(3.0, 0);
        let mut out = Buffer::new(PortType::Audio, 8);

        instance
            .unit
            .process(0, &proc_info(8), &[&input, &gain], &mut [&mut out]);

        assert_eq!(out.samples(), &[1.5; 8]);
    }

    #[test]
    fn osc_voices_are_independent() {
        let path = Path::new("/main/osc").unwrap();
        let mut host = BuiltinHost::new();
        let mut instance = host.instantiate(&info("gen:osc", &path, 2)).unwrap();

        let mut freq = Buffer::new(PortType::Control, 1);
        freq.set_value(1000.0, 0);
        let mut a = Buffer::new(PortType::Audio, 8);
        let mut b = Buffer::new(PortType::Audio, 8);

        instance
            .unit
            .process(0, &proc_info(8), &[&freq], &mut [&mut a]);
        instance
            .unit
            .process(0, &proc_info(8), &[&freq], &mut [&mut a]);
        instance
            .unit
            .process(1, &proc_info(8), &[&freq], &mut [&mut b]);

        // Voice 0 has advanced by one cycle, voice 1 starts at phase 0.
        assert_eq!(b.samples()[0], 0.0);
        assert_ne!(a.samples()[0], 0.0);
    }

    #[test]
    fn registered_plugins_shadow_builtins() {
        let path = Path::new("/main/x").unwrap();
        let mut host = BuiltinHost::new();
        host.register("gen:osc", |_| None);

        assert!(host.instantiate(&info("gen:osc", &path, 1)).is_none());
    }
}
