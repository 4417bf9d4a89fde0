//! The seam between the engine and audio I/O.

use std::error::Error;

use crate::processor::EngineProcessor;

/// Runs an [`EngineProcessor`] once per audio cycle.
///
/// A driver must call [`EngineProcessor::process`] (or
/// [`EngineProcessor::process_interleaved`]) with ranges of sample time
/// that increase monotonically and never overlap.
pub trait AudioDriver {
    /// Keeps the stream alive. Dropping it stops the stream.
    type StreamHandle;
    type Error: Error + 'static;

    fn sample_rate(&self) -> u32;

    /// The maximum number of frames the driver processes at once.
    fn cycle_size(&self) -> usize;

    fn start(&mut self, processor: EngineProcessor) -> Result<Self::StreamHandle, Self::Error>;
}

pub mod dummy {
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicU64, Ordering},
            Arc,
        },
        thread::JoinHandle,
        time::{Duration, Instant},
    };

    use patchbay_core::node::StreamStatus;

    use super::AudioDriver;
    use crate::{engine::AudioParams, processor::EngineProcessor};

    /// A driver without any audio device that processes in real time on
    /// a timer thread and discards the output.
    #[derive(Debug, Clone)]
    pub struct DummyDriver {
        params: AudioParams,
        num_out_channels: usize,
    }

    impl DummyDriver {
        pub fn new(params: AudioParams, num_out_channels: usize) -> Self {
            Self {
                params: AudioParams {
                    sample_rate: params.sample_rate,
                    cycle_size: params.cycle_size.max(1),
                },
                num_out_channels,
            }
        }
    }

    impl AudioDriver for DummyDriver {
        type StreamHandle = DummyStreamHandle;
        type Error = DummyDriverError;

        fn sample_rate(&self) -> u32 {
            self.params.sample_rate
        }

        fn cycle_size(&self) -> usize {
            self.params.cycle_size
        }

        fn start(
            &mut self,
            mut processor: EngineProcessor,
        ) -> Result<Self::StreamHandle, Self::Error> {
            let run = Arc::new(AtomicBool::new(true));
            let frames_processed = Arc::new(AtomicU64::new(0));

            let sample_rate = self.params.sample_rate as f64;
            let cycle_size = self.params.cycle_size;
            let channels = self.num_out_channels;

            processor.prepare_interleaved(0, channels);

            let thread = {
                let run = Arc::clone(&run);
                let frames_processed = Arc::clone(&frames_processed);

                std::thread::Builder::new()
                    .name(String::from("patchbay-dummy"))
                    .spawn(move || {
                        let mut output = vec![0.0; cycle_size * channels];
                        let mut frame_time: u64 = 0;
                        let mut due: f64 = 0.0;
                        let mut last_instant = Instant::now();

                        while run.load(Ordering::Relaxed) {
                            std::thread::sleep(Duration::from_millis(1));

                            due += last_instant.elapsed().as_secs_f64() * sample_rate;
                            last_instant = Instant::now();

                            let mut frames = due as usize;
                            due -= frames as f64;

                            while frames > 0 {
                                let block = frames.min(cycle_size);

                                processor.process_interleaved(
                                    frame_time..frame_time + block as u64,
                                    &[],
                                    0,
                                    &mut output[..block * channels],
                                    channels,
                                    StreamStatus::empty(),
                                );

                                frame_time += block as u64;
                                frames -= block;
                            }

                            frames_processed.store(frame_time, Ordering::Relaxed);
                        }

                        processor
                    })?
            };

            log::debug!(
                "started dummy driver: {} Hz, {} frames per cycle",
                self.params.sample_rate,
                cycle_size
            );

            Ok(DummyStreamHandle {
                run,
                frames_processed,
                thread: Some(thread),
            })
        }
    }

    pub struct DummyStreamHandle {
        run: Arc<AtomicBool>,
        frames_processed: Arc<AtomicU64>,
        thread: Option<JoinHandle<EngineProcessor>>,
    }

    impl DummyStreamHandle {
        /// The number of frames processed so far.
        pub fn frames_processed(&self) -> u64 {
            self.frames_processed.load(Ordering::Relaxed)
        }

        /// Stop the stream and get the processor back.
        ///
        /// Returns `None` if the audio thread panicked.
        pub fn stop(mut self) -> Option<EngineProcessor> {
            self.run.store(false, Ordering::Relaxed);
            self.thread.take()?.join().ok()
        }
    }

    impl Drop for DummyStreamHandle {
        fn drop(&mut self) {
            self.run.store(false, Ordering::Relaxed);

            if let Some(thread) = self.thread.take() {
                if thread.join().is_err() {
                    log::error!("dummy audio thread panicked");
                }
            }
        }
    }

    #[derive(Debug, thiserror::Error)]
    pub enum DummyDriverError {
        #[error("failed to spawn the dummy audio thread: {0}")]
        Spawn(#[from] std::io::Error),
    }
}
