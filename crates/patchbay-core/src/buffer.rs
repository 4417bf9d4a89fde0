use std::sync::{Arc, Mutex};

use ahash::AHashMap;

/// The kind of data carried by a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PortType {
    /// A single value per cycle.
    Control,
    /// One sample per frame.
    Audio,
    /// A list of timestamped events.
    Event,
}

impl PortType {
    pub fn is_sample_type(&self) -> bool {
        matches!(self, Self::Control | Self::Audio)
    }
}

/// A short timestamped event message (e.g. a MIDI message).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TimedEvent {
    /// The frame offset of this event within the current cycle.
    pub frame: u32,
    pub data: [u8; 3],
}

/// A signal buffer for one voice of one port.
///
/// Control buffers hold a single sample, audio buffers hold one sample
/// per frame of the cycle, and event buffers hold up to `capacity`
/// events. None of the methods used while processing ever reallocate.
#[derive(Debug, Clone)]
pub struct Buffer {
    port_type: PortType,
    samples: Vec<f32>,
    events: Vec<TimedEvent>,
}

impl Buffer {
    pub fn new(port_type: PortType, size: usize) -> Self {
        let size = size.max(1);

        match port_type {
            PortType::Control => Self {
                port_type,
                samples: vec![0.0; 1],
                events: Vec::new(),
            },
            PortType::Audio => Self {
                port_type,
                samples: vec![0.0; size],
                events: Vec::new(),
            },
            PortType::Event => Self {
                port_type,
                samples: Vec::new(),
                events: Vec::with_capacity(size),
            },
        }
    }

    pub fn port_type(&self) -> PortType {
        self.port_type
    }

    /// The number of samples, or the event capacity for event buffers.
    pub fn size(&self) -> usize {
        match self.port_type {
            PortType::Event => self.events.capacity(),
            _ => self.samples.len(),
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn samples_mut(&mut self) -> &mut [f32] {
        &mut self.samples
    }

    pub fn events(&self) -> &[TimedEvent] {
        &self.events
    }

    /// Push an event into the buffer.
    ///
    /// Returns `false` if the buffer is full.
    pub fn push_event(&mut self, event: TimedEvent) -> bool {
        if self.events.len() == self.events.capacity() {
            return false;
        }

        self.events.push(event);
        true
    }

    /// Fill the buffer with silence (or drop all events).
    pub fn clear(&mut self) {
        self.samples.fill(0.0);
        self.events.clear();
    }

    /// Set the value of the buffer starting at `offset`.
    ///
    /// Control buffers ignore the offset. An offset past the end of an
    /// audio buffer is treated as `0`.
    pub fn set_value(&mut self, value: f32, offset: usize) {
        match self.port_type {
            PortType::Control => self.samples[0] = value,
            PortType::Audio => {
                let offset = if offset >= self.samples.len() {
                    0
                } else {
                    offset
                };
                self.samples[offset..].fill(value);
            }
            PortType::Event => {}
        }
    }

    /// The representative value of this buffer: the control value, or
    /// the peak magnitude of an audio buffer.
    pub fn value(&self) -> f32 {
        match self.port_type {
            PortType::Control => self.samples[0],
            PortType::Audio => self.samples.iter().fold(0.0f32, |m, s| m.max(s.abs())),
            PortType::Event => 0.0,
        }
    }

    /// Sum the contents of `other` into this buffer.
    ///
    /// A control source is broadcast over every frame of an audio
    /// destination. Events that do not fit are dropped.
    pub fn accumulate(&mut self, other: &Buffer) {
        match (self.port_type, other.port_type) {
            (PortType::Event, PortType::Event) => {
                for ev in other.events.iter() {
                    if !self.push_event(*ev) {
                        break;
                    }
                }
            }
            (PortType::Audio, PortType::Control) => {
                let v = other.samples[0];
                for s in self.samples.iter_mut() {
                    *s += v;
                }
            }
            (PortType::Control, PortType::Audio) => {
                self.samples[0] += other.samples.first().copied().unwrap_or(0.0);
            }
            _ => {
                for (d, s) in self.samples.iter_mut().zip(other.samples.iter()) {
                    *d += *s;
                }
            }
        }
    }

    /// Overwrite this buffer with the contents of `other`.
    pub fn copy_from(&mut self, other: &Buffer) {
        self.clear();
        self.accumulate(other);
    }
}

/// Allocates signal buffers and recycles retired ones.
///
/// This is cheap to clone, and all clones share the same pool. It is
/// only used from the control and reclamation contexts.
#[derive(Clone)]
pub struct BufferFactory {
    pools: Arc<Mutex<AHashMap<(PortType, usize), Vec<Buffer>>>>,
    max_pooled: usize,
}

impl BufferFactory {
    /// `max_pooled` is the maximum number of idle buffers kept per
    /// type and size.
    pub fn new(max_pooled: usize) -> Self {
        Self {
            pools: Arc::new(Mutex::new(AHashMap::default())),
            max_pooled,
        }
    }

    /// Get a cleared buffer of the given type and size.
    pub fn allocate(&self, port_type: PortType, size: usize) -> Buffer {
        let key = Self::key(port_type, size);

        let recycled = self
            .pools
            .lock()
            .ok()
            .and_then(|mut pools| pools.get_mut(&key).and_then(|pool| pool.pop()));

        recycled.unwrap_or_else(|| Buffer::new(port_type, size))
    }

    /// Return a buffer to the pool instead of freeing it.
    pub fn recycle(&self, mut buffer: Buffer) {
        buffer.clear();

        let key = (buffer.port_type, buffer.size());

        if let Ok(mut pools) = self.pools.lock() {
            let pool = pools.entry(key).or_default();
            if pool.len() < self.max_pooled {
                pool.push(buffer);
            }
        }
    }

    /// The number of idle buffers in the pool.
    pub fn num_pooled(&self) -> usize {
        self.pools
            .lock()
            .map(|pools| pools.values().map(|p| p.len()).sum())
            .unwrap_or(0)
    }

    fn key(port_type: PortType, size: usize) -> (PortType, usize) {
        let size = size.max(1);
        match port_type {
            PortType::Control => (port_type, 1),
            _ => (port_type, size),
        }
    }
}

impl Default for BufferFactory {
    fn default() -> Self {
        Self::new(64)
    }
}
