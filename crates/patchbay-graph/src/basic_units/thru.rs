use patchbay_core::{
    node::{ExecContext, Instance, InstantiateInfo, PortDirection, PortSpec, ProcInfo, ProcessingUnit},
    Buffer, PortType,
};

/// Copies a control value from its input to its output.
///
/// The message variant runs both ports in the message context, so
/// connecting it to audio-context ports goes through transfer queues.
pub struct ThruUnit;

impl ThruUnit {
    pub const CONTROL_PLUGIN: &'static str = "util:control_thru";
    pub const MESSAGE_PLUGIN: &'static str = "util:message_thru";

    pub(super) fn instantiate(_info: &InstantiateInfo, message: bool) -> Instance {
        let context = if message {
            ExecContext::Message
        } else {
            ExecContext::Audio
        };

        Instance {
            unit: Box::new(Self),
            ports: vec![
                PortSpec::new("in", PortDirection::Input, PortType::Control).with_context(context),
                PortSpec::new("out", PortDirection::Output, PortType::Control)
                    .with_context(context),
            ],
        }
    }
}

impl ProcessingUnit for ThruUnit {
    fn process(
        &mut self,
        _voice: usize,
        _proc_info: &ProcInfo,
        inputs: &[&Buffer],
        outputs: &mut [&mut Buffer],
    ) {
        let value = inputs.first().map(|b| b.value()).unwrap_or(0.0);

        if let Some(out) = outputs.first_mut() {
            out.set_value(value, 0);
        }
    }
}
