use patchbay_core::{
    node::{Instance, InstantiateInfo, PortDirection, PortSpec, ProcInfo, ProcessingUnit},
    Buffer, PortType,
};

/// Writes the value of its control input to every frame of its output.
pub struct ConstUnit;

impl ConstUnit {
    pub const PLUGIN: &'static str = "gen:const";

    pub(super) fn instantiate(_info: &InstantiateInfo) -> Instance {
        Instance {
            unit: Box::new(Self),
            ports: vec![
                PortSpec::new("value", PortDirection::Input, PortType::Control),
                PortSpec::new("out", PortDirection::Output, PortType::Audio),
            ],
        }
    }
}

impl ProcessingUnit for ConstUnit {
    fn process(
        &mut self,
        _voice: usize,
        proc_info: &ProcInfo,
        inputs: &[&Buffer],
        outputs: &mut [&mut Buffer],
    ) {
        let value = inputs.first().map(|b| b.value()).unwrap_or(0.0);

        if let Some(out) = outputs.first_mut() {
            for s in out.samples_mut().iter_mut().take(proc_info.frames) {
                *s = value;
            }
        }
    }
}
