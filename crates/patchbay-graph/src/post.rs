use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use ahash::AHashMap;
use atomic_float::AtomicF32;

use patchbay_core::{maid::Maid, BufferFactory, Path};

use crate::{
    error::EngineError,
    event::{Event, WatchOp},
    notify::{Notification, NotificationSink},
    rt::{Garbage, RtDiagnostics},
};

struct PortWatch {
    value: Arc<AtomicF32>,
    last: f32,
}

struct QueueWatch {
    dropped: Arc<AtomicU64>,
    reported: u64,
}

/// The reclamation and notification half of the engine.
///
/// [`PostProcessor::update`] must be called regularly from a thread
/// that is allowed to free memory. It replies to executed events,
/// broadcasts what changed, and frees everything the realtime thread
/// retired.
pub struct PostProcessor {
    from_rt: rtrb::Consumer<Box<Event>>,
    maid: Maid<Garbage>,
    factory: BufferFactory,
    sink: Box<dyn NotificationSink>,

    ports: AHashMap<Path, PortWatch>,
    queues: AHashMap<(Path, Path), QueueWatch>,

    diagnostics: Arc<RtDiagnostics>,
    reported_skipped: u64,
    reported_lost: u64,
}

impl PostProcessor {
    pub(crate) fn new(
        from_rt: rtrb::Consumer<Box<Event>>,
        maid: Maid<Garbage>,
        factory: BufferFactory,
        diagnostics: Arc<RtDiagnostics>,
    ) -> Self {
        Self {
            from_rt,
            maid,
            factory,
            sink: Box::new(|_: Notification| {}),
            ports: AHashMap::default(),
            queues: AHashMap::default(),
            diagnostics,
            reported_skipped: 0,
            reported_lost: 0,
        }
    }

    /// Set where notifications are sent. By default they are discarded.
    pub fn set_sink(&mut self, sink: impl NotificationSink) {
        self.sink = Box::new(sink);
    }

    /// Post-process every executed event, poll the watched values and
    /// free retired objects.
    ///
    /// Returns the number of events that were post-processed.
    pub fn update(&mut self) -> usize {
        let mut count = 0;

        while let Ok(mut event) = self.from_rt.pop() {
            let watches = event.post_process(self.sink.as_mut());
            for op in watches {
                self.apply_watch(op);
            }

            // Retired objects the maid had no room for.
            if let Some(retired) = event.take_retired() {
                retired.recycle_into(&self.factory);
            }

            count += 1;
        }

        self.poll_ports();
        self.poll_queues();
        self.poll_diagnostics();

        let factory = &self.factory;
        let freed = self.maid.cleanup_with(|garbage| match garbage {
            Garbage::Retired(retired) => retired.recycle_into(factory),
            Garbage::Graph(graph) => drop(graph),
        });

        if freed > 0 {
            log::trace!("freed {} retired objects", freed);
        }

        count
    }

    fn apply_watch(&mut self, op: WatchOp) {
        match op {
            WatchOp::Port { path, value } => {
                // Never equal to anything, so the current value is sent
                // on the next poll.
                let last = f32::NAN;
                self.ports.insert(path, PortWatch { value, last });
            }
            WatchOp::Unwatch(path) => {
                self.ports.remove(&path);
            }
            WatchOp::Queue { src, dst, dropped } => {
                let reported = dropped.load(Ordering::Relaxed);
                self.queues
                    .insert((src, dst), QueueWatch { dropped, reported });
            }
            WatchOp::UnwatchQueue { src, dst } => {
                self.queues.remove(&(src, dst));
            }
            WatchOp::UnwatchUnder(path) => {
                let under = |p: &Path| p == &path || p.is_descendant_of(&path);

                self.ports.retain(|p, _| !under(p));
                self.queues
                    .retain(|(src, dst), _| !under(src) && !under(dst));
            }
        }
    }

    fn poll_ports(&mut self) {
        for (path, watch) in self.ports.iter_mut() {
            let value = watch.value.load(Ordering::Relaxed);
            if value != watch.last {
                watch.last = value;
                self.sink.notify(Notification::PortValue {
                    path: path.clone(),
                    value,
                });
            }
        }
    }

    fn poll_queues(&mut self) {
        for ((src, dst), watch) in self.queues.iter_mut() {
            let dropped = watch.dropped.load(Ordering::Relaxed);
            if dropped > watch.reported {
                let e = EngineError::QueueOverflow {
                    src: src.clone(),
                    dst: dst.clone(),
                    dropped: dropped - watch.reported,
                };
                watch.reported = dropped;

                log::warn!("{}", e);
                self.sink.notify(Notification::Error(e));
            }
        }
    }

    fn poll_diagnostics(&mut self) {
        let skipped = self.diagnostics.skipped_steps.load(Ordering::Relaxed);
        if skipped > self.reported_skipped {
            let e = EngineError::InternalError(format!(
                "{} processing steps skipped because their handles did not resolve",
                skipped - self.reported_skipped
            ));
            self.reported_skipped = skipped;

            log::error!("{}", e);
            self.sink.notify(Notification::Error(e));
        }

        let lost = self.diagnostics.lost_objects.load(Ordering::Relaxed);
        if lost > self.reported_lost {
            let e = EngineError::InternalError(format!(
                "{} objects leaked by the realtime thread",
                lost - self.reported_lost
            ));
            self.reported_lost = lost;

            log::error!("{}", e);
            self.sink.notify(Notification::Error(e));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use patchbay_core::maid::maid;

    use super::*;

    fn post_processor() -> (PostProcessor, Arc<RtDiagnostics>, Arc<Mutex<Vec<Notification>>>) {
        let (_to_post, from_rt) = rtrb::RingBuffer::<Box<Event>>::new(4);
        let (_handle, maid) = maid::<Garbage>(4);
        let diagnostics = Arc::new(RtDiagnostics::default());

        let mut post = PostProcessor::new(
            from_rt,
            maid,
            BufferFactory::default(),
            Arc::clone(&diagnostics),
        );

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        post.set_sink(move |n: Notification| sink.lock().unwrap().push(n));

        (post, diagnostics, received)
    }

    fn path(p: &str) -> Path {
        Path::new(p).unwrap()
    }

    #[test]
    fn queue_overflow_is_reported_as_a_delta() {
        let (mut post, _, received) = post_processor();

        let dropped = Arc::new(AtomicU64::new(3));
        post.apply_watch(WatchOp::Queue {
            src: path("/a/out"),
            dst: path("/m/in"),
            dropped: Arc::clone(&dropped),
        });

        // Samples dropped before the watch started are not reported.
        post.update();
        assert!(received.lock().unwrap().is_empty());

        dropped.store(8, Ordering::Relaxed);
        post.update();
        post.update();

        assert_eq!(
            received.lock().unwrap().as_slice(),
            &[Notification::Error(EngineError::QueueOverflow {
                src: path("/a/out"),
                dst: path("/m/in"),
                dropped: 5,
            })]
        );

        post.apply_watch(WatchOp::UnwatchUnder(path("/m")));
        dropped.store(20, Ordering::Relaxed);
        post.update();
        assert_eq!(received.lock().unwrap().len(), 1);
    }

    #[test]
    fn diagnostics_are_reported_once() {
        let (mut post, diagnostics, received) = post_processor();

        diagnostics.skip_step();
        diagnostics.skip_step();
        diagnostics.lost_objects.fetch_add(1, Ordering::Relaxed);

        post.update();
        post.update();

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 2);
        assert!(received
            .iter()
            .all(|n| matches!(n, Notification::Error(EngineError::InternalError(_)))));
    }

    #[test]
    fn port_watch_reports_changes_only() {
        let (mut post, _, received) = post_processor();

        let value = Arc::new(AtomicF32::new(0.5));
        post.apply_watch(WatchOp::Port {
            path: path("/src/out"),
            value: Arc::clone(&value),
        });

        post.update();
        post.update();
        value.store(0.25, Ordering::Relaxed);
        post.update();

        post.apply_watch(WatchOp::Unwatch(path("/src/out")));
        value.store(1.0, Ordering::Relaxed);
        post.update();

        assert_eq!(
            received.lock().unwrap().as_slice(),
            &[
                Notification::PortValue {
                    path: path("/src/out"),
                    value: 0.5,
                },
                Notification::PortValue {
                    path: path("/src/out"),
                    value: 0.25,
                },
            ]
        );
    }
}
