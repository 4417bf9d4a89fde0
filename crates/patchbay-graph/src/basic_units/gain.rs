use patchbay_core::{
    node::{Instance, InstantiateInfo, PortDirection, PortSpec, ProcInfo, ProcessingUnit},
    Buffer, PortType,
};

pub struct GainUnit;

impl GainUnit {
    pub const PLUGIN: &'static str = "fx:gain";

    pub(super) fn instantiate(_info: &InstantiateInfo) -> Instance {
        Instance {
            unit: Box::new(Self),
            ports: vec![
                PortSpec::new("in", PortDirection::Input, PortType::Audio),
                PortSpec::new("gain", PortDirection::Input, PortType::Control).with_default(1.0),
                PortSpec::new("out", PortDirection::Output, PortType::Audio),
            ],
        }
    }
}

impl ProcessingUnit for GainUnit {
    fn process(
        &mut self,
        _voice: usize,
        proc_info: &ProcInfo,
        inputs: &[&Buffer],
        outputs: &mut [&mut Buffer],
    ) {
        let (Some(input), Some(out)) = (inputs.first(), outputs.first_mut()) else {
            return;
        };
        let gain = inputs.get(1).map(|b| b.value()).unwrap_or(1.0);

        let frames = proc_info.frames;

        if gain.abs() < 0.00001 {
            // Muted, so there is no need to process.
            out.clear();
            return;
        }

        for (o, i) in out
            .samples_mut()
            .iter_mut()
            .zip(input.samples().iter())
            .take(frames)
        {
            *o = *i * gain;
        }
    }
}
