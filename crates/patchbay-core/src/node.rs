use crate::{Buffer, Path, PortType};

/// The direction of a port, as seen from the object that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortDirection {
    Input,
    Output,
}

/// The scheduling context a port's data is produced or consumed in.
///
/// Connections between ports of different contexts go through a
/// transfer queue instead of a shared buffer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecContext {
    #[default]
    Audio,
    Message,
}

/// Describes one port of a plugin instance.
#[derive(Debug, Clone, PartialEq)]
pub struct PortSpec {
    /// The symbol of the port, which becomes the last segment of its path.
    pub symbol: String,
    pub direction: PortDirection,
    pub port_type: PortType,
    pub context: ExecContext,
    /// The initial value of a control or audio input.
    pub default_value: f32,
}

impl PortSpec {
    pub fn new(symbol: &str, direction: PortDirection, port_type: PortType) -> Self {
        Self {
            symbol: symbol.to_string(),
            direction,
            port_type,
            context: ExecContext::Audio,
            default_value: 0.0,
        }
    }

    pub fn with_context(mut self, context: ExecContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_default(mut self, default_value: f32) -> Self {
        self.default_value = default_value;
        self
    }
}

/// An instantiated plugin: its processing unit and its port layout.
pub struct Instance {
    pub unit: Box<dyn ProcessingUnit>,
    /// The ports of the instance in index order.
    pub ports: Vec<PortSpec>,
}

/// The parameters a plugin is instantiated with.
#[derive(Debug, Clone)]
pub struct InstantiateInfo<'a> {
    /// The identifier of the plugin to instantiate.
    pub plugin: &'a str,
    /// The path the new node will live at.
    pub path: &'a Path,
    /// The number of voices the unit must be able to process.
    pub polyphony: u32,
    pub sample_rate: u32,
    /// The maximum number of frames in a cycle.
    pub cycle_size: usize,
}

/// Instantiates plugins on behalf of the engine.
///
/// This is only ever called from the control context, so it may
/// allocate and block.
pub trait PluginHost: 'static + Send {
    /// Returns `None` if the plugin could not be instantiated.
    fn instantiate(&mut self, info: &InstantiateInfo) -> Option<Instance>;
}

/// The realtime half of a plugin instance.
pub trait ProcessingUnit: 'static + Send {
    /// Process one voice for the current cycle.
    ///
    /// `inputs` and `outputs` are ordered by port index within their
    /// direction. Only the first `proc_info.frames` samples of audio
    /// buffers are part of this cycle, and all of them must be written.
    ///
    /// This is called once per voice per cycle, and must not allocate,
    /// lock, or block.
    fn process(
        &mut self,
        voice: usize,
        proc_info: &ProcInfo,
        inputs: &[&Buffer],
        outputs: &mut [&mut Buffer],
    );
}

/// Additional information for processing a cycle
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcInfo {
    /// The number of frames in this cycle.
    pub frames: usize,

    /// The sample time of the first frame in this cycle.
    pub cycle_start: u64,

    pub sample_rate: u32,

    /// Flags indicating the current status of the audio stream
    pub stream_status: StreamStatus,
}

bitflags::bitflags! {
    /// Flags indicating the current status of the audio stream
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct StreamStatus: u32 {
        /// Some input data was discarded because of an overflow condition
        /// at the audio driver.
        const INPUT_OVERFLOW = 0b01;

        /// The output buffer ran low, likely producing a break in the
        /// output sound.
        const OUTPUT_UNDERFLOW = 0b10;
    }
}
