use patchbay_core::{
    node::{ExecContext, Instance, InstantiateInfo, PortDirection, PortSpec, ProcInfo, ProcessingUnit},
    Buffer, PortType,
};

/// A sine oscillator with one phase per voice.
pub struct OscUnit {
    phasors: Vec<f32>,
}

impl OscUnit {
    pub const PLUGIN: &'static str = "gen:osc";
    pub const DEFAULT_FREQ_HZ: f32 = 440.0;

    pub(super) fn instantiate(info: &InstantiateInfo) -> Instance {
        Instance {
            unit: Box::new(Self {
                phasors: vec![0.0; info.polyphony.max(1) as usize],
            }),
            ports: vec![
                PortSpec::new("freq", PortDirection::Input, PortType::Control)
                    .with_context(ExecContext::Audio)
                    .with_default(Self::DEFAULT_FREQ_HZ),
                PortSpec::new("out", PortDirection::Output, PortType::Audio),
            ],
        }
    }
}

impl ProcessingUnit for OscUnit {
    fn process(
        &mut self,
        voice: usize,
        proc_info: &ProcInfo,
        inputs: &[&Buffer],
        outputs: &mut [&mut Buffer],
    ) {
        let Some(out) = outputs.first_mut() else {
            return;
        };

        let Some(phasor) = self.phasors.get_mut(voice) else {
            out.clear();
            return;
        };

        let freq_hz = inputs
            .first()
            .map(|b| b.value())
            .unwrap_or(Self::DEFAULT_FREQ_HZ)
            .clamp(0.0, proc_info.sample_rate as f32 * 0.5);
        let phasor_inc = freq_hz / proc_info.sample_rate.max(1) as f32;

        for s in out.samples_mut().iter_mut().take(proc_info.frames) {
            *s = (*phasor * std::f32::consts::TAU).sin();
            *phasor = (*phasor + phasor_inc).fract();
        }
    }
}
