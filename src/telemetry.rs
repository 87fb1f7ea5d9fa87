/*!
    cycle timing values published by the realtime context, for a lower priority context to read.

    The realtime side only stores word-sized atomics and never waits on the reader. A [Monitor] running in a tokio runtime samples them at its own pace.
*/

use crate::scheduler::CycleTiming;
use core::{
    sync::atomic::{AtomicU32, AtomicU64, Ordering::Relaxed},
    time::Duration,
    };
use std::sync::Arc;
use tokio::{
    sync::watch,
    task::JoinHandle,
    };
use log::debug;


/// shortest sampling period of a [Monitor], shorter periods are raised to it
pub const MIN_SAMPLE_PERIOD: Duration = Duration::from_millis(1);

/**
    values published by a [crate::CycleDriver] after each cycle

    Durations are stored in nanoseconds since the cycle start, saturating at `u32::MAX`. Counters only grow.
*/
#[derive(Debug, Default)]
pub struct Telemetry {
    pre_io: AtomicU32,
    post_io: AtomicU32,
    finished: AtomicU32,
    cycles: AtomicU64,
    overruns: AtomicU64,
    errors: AtomicU64,
    missed: AtomicU64,
    forwarded: AtomicU64,
}

/// copy of [Telemetry] values at some instant
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TimingSnapshot {
    /// nanoseconds from cycle start to the beginning of exchanges, in the last cycle
    pub pre_io: u32,
    /// nanoseconds from cycle start to the end of exchanges, in the last cycle
    pub post_io: u32,
    /// nanoseconds from cycle start to the end of the cycle, in the last cycle
    pub finished: u32,
    /// cycles run
    pub cycles: u64,
    /// cycles that exceeded their budget
    pub overruns: u64,
    /// cycles that failed for another reason
    pub errors: u64,
    /// ticks skipped because the previous cycle ended too late
    pub missed: u64,
    /// ticks forwarded to the host
    pub forwarded: u64,
}

fn nanos(duration: Duration) -> u32 {
    u32::try_from(duration.as_nanos()).unwrap_or(u32::MAX)
}

impl Telemetry {
    pub fn new() -> Self {Self::default()}

    /// publish the timing of a completed cycle
    pub fn publish(&self, timing: &CycleTiming) {
        self.pre_io.store(nanos(timing.pre_io), Relaxed);
        self.post_io.store(nanos(timing.post_io), Relaxed);
        self.finished.store(nanos(timing.finished), Relaxed);
        self.cycles.fetch_add(1, Relaxed);
    }
    pub fn record_overrun(&self)  {self.overruns.fetch_add(1, Relaxed);}
    pub fn record_error(&self)  {self.errors.fetch_add(1, Relaxed);}
    pub fn record_missed(&self, ticks: u64)  {self.missed.fetch_add(ticks, Relaxed);}
    pub fn record_forwarded(&self)  {self.forwarded.fetch_add(1, Relaxed);}

    /**
        read all values

        Values are read one by one, so they may come from two consecutive cycles when the realtime context publishes meanwhile.
    */
    pub fn snapshot(&self) -> TimingSnapshot {
        TimingSnapshot {
            pre_io: self.pre_io.load(Relaxed),
            post_io: self.post_io.load(Relaxed),
            finished: self.finished.load(Relaxed),
            cycles: self.cycles.load(Relaxed),
            overruns: self.overruns.load(Relaxed),
            errors: self.errors.load(Relaxed),
            missed: self.missed.load(Relaxed),
            forwarded: self.forwarded.load(Relaxed),
        }
    }
}

/**
    tokio task sampling a [Telemetry] periodically

    It must be created from within a tokio runtime. The latest sample can be read at any time, or awaited with [Self::subscribe].
*/
pub struct Monitor {
    receiver: watch::Receiver<TimingSnapshot>,
    task: JoinHandle<()>,
}
impl Monitor {
    /// start sampling every `period`, at least [MIN_SAMPLE_PERIOD]
    pub fn spawn(telemetry: Arc<Telemetry>, period: Duration) -> Self {
        let period = period.max(MIN_SAMPLE_PERIOD);
        let (sender, receiver) = watch::channel(telemetry.snapshot());
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let sample = telemetry.snapshot();
                debug!("cycle timing: pre-io {} ns, post-io {} ns, finished {} ns, {} cycles, {} overruns",
                    sample.pre_io, sample.post_io, sample.finished, sample.cycles, sample.overruns);
                if sender.send(sample).is_err()  {break}
            }
        });
        Self {receiver, task}
    }
    /// last sample taken
    pub fn latest(&self) -> TimingSnapshot {
        *self.receiver.borrow()
    }
    /// receiver notified at every new sample
    pub fn subscribe(&self) -> watch::Receiver<TimingSnapshot> {
        self.receiver.clone()
    }
    /// stop sampling
    pub fn stop(self) {
        self.task.abort();
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish() {
        let telemetry = Telemetry::new();
        telemetry.publish(&CycleTiming {
            pre_io: Duration::from_nanos(100),
            post_io: Duration::from_micros(20),
            finished: Duration::from_secs(10),
            });
        telemetry.record_overrun();
        let sample = telemetry.snapshot();
        assert_eq!(sample.pre_io, 100);
        assert_eq!(sample.post_io, 20_000);
        assert_eq!(sample.finished, u32::MAX);
        assert_eq!(sample.cycles, 1);
        assert_eq!(sample.overruns, 1);
    }

    #[tokio::test]
    async fn monitor_samples() {
        let telemetry = Arc::new(Telemetry::new());
        let monitor = Monitor::spawn(telemetry.clone(), Duration::from_millis(1));
        let mut samples = monitor.subscribe();
        telemetry.record_forwarded();
        loop {
            samples.changed().await.unwrap();
            if samples.borrow().forwarded == 1  {break}
        }
        assert_eq!(monitor.latest().forwarded, 1);
        monitor.stop();
    }

    #[tokio::test]
    async fn null_period_is_raised() {
        let telemetry = Arc::new(Telemetry::new());
        let monitor = Monitor::spawn(telemetry.clone(), Duration::ZERO);
        let mut samples = monitor.subscribe();
        telemetry.record_error();
        loop {
            samples.changed().await.unwrap();
            if samples.borrow().errors == 1  {break}
        }
        monitor.stop();
    }
}
