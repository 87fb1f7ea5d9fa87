/*!
    periodic execution of the master cycles

    A [CycleDriver] runs exactly one master cycle per tick of a periodic clock, publishes the cycle timing to a [Telemetry], and forwards one tick out of `k` to a host timekeeper, so that a host clock driven by the same timer keeps advancing at its own rate.

    The driver can be ticked by any external periodic source with [CycleDriver::tick], or run its own realtime thread with [CycleDriver::spawn].
*/

use crate::{
    master::Master,
    socket::EthercatSocket,
    scheduler::CycleTiming,
    telemetry::Telemetry,
    error::{EthercatError, EthercatResult},
    };
use core::{
    time::Duration,
    sync::atomic::{AtomicBool, Ordering},
    };
use std::{
    sync::Arc,
    thread::JoinHandle,
    time::Instant,
    };
use log::{error, info, warn};


/// settings of a [CycleDriver]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DriverConfig {
    /// cycles per second
    pub control_frequency: u32,
    /// ticks per second expected by the host timekeeper, it must divide the control frequency
    pub host_frequency: u32,
    /// raise the driver thread to realtime FIFO scheduling, this usually needs privileges
    pub realtime: bool,
}
impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            control_frequency: 1000,
            host_frequency: 250,
            realtime: false,
        }
    }
}
impl DriverConfig {
    /// duration between two cycles
    pub fn period(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / u64::from(self.control_frequency.max(1)))
    }
    /// number of control ticks per host tick
    pub fn host_ratio(&self) -> EthercatResult<u32> {
        if self.control_frequency == 0 || self.host_frequency == 0
            {return Err(EthercatError::Master("driver frequencies must not be null"))}
        if self.control_frequency % self.host_frequency != 0
            {return Err(EthercatError::Master("control frequency must be a multiple of host frequency"))}
        Ok(self.control_frequency / self.host_frequency)
    }
}

/// counts ticks and tells when one out of `k` is reached
#[derive(Copy, Clone, Debug)]
pub struct TickDivider {
    every: u32,
    counter: u32,
}
impl TickDivider {
    pub fn new(every: u32) -> Self {
        Self {every: every.max(1), counter: 0}
    }
    pub fn every(&self) -> u32  {self.every}
    /// count one tick, returns true on every `k`-th tick
    pub fn tick(&mut self) -> bool {
        self.counter += 1;
        if self.counter >= self.every {
            self.counter = 0;
            true
        }
        else {false}
    }
}

/// host timekeeper receiving the forwarded ticks
pub trait HostTick {
    fn forward(&mut self);
}
impl<F: FnMut()> HostTick for F {
    fn forward(&mut self) {self()}
}
/// host timekeeper for when no host needs ticks
#[derive(Copy, Clone, Debug, Default)]
pub struct NoHost;
impl HostTick for NoHost {
    fn forward(&mut self) {}
}

/// runs one master cycle per tick, see the module documentation
pub struct CycleDriver<H: HostTick> {
    config: DriverConfig,
    divider: TickDivider,
    host: H,
    telemetry: Arc<Telemetry>,
}
impl<H: HostTick> CycleDriver<H> {
    pub fn new(config: DriverConfig, host: H) -> EthercatResult<Self> {
        Ok(Self {
            divider: TickDivider::new(config.host_ratio()?),
            config,
            host,
            telemetry: Arc::new(Telemetry::new()),
        })
    }
    pub fn config(&self) -> &DriverConfig  {&self.config}
    /// shared telemetry, to give to a [crate::Monitor]
    pub fn telemetry(&self) -> Arc<Telemetry>  {self.telemetry.clone()}

    /**
        run one cycle of the master, then forward the tick to the host if due

        Errors are counted in telemetry and logged, they are also returned but the driver is ready for the next tick anyway.
    */
    pub fn tick<S, F>(&mut self, master: &mut Master<S>, app: F) -> EthercatResult<CycleTiming>
    where
        S: EthercatSocket,
        F: FnOnce(&mut Master<S>),
    {
        self.tick_from(Instant::now(), master, app)
    }

    fn tick_from<S, F>(&mut self, start: Instant, master: &mut Master<S>, app: F) -> EthercatResult<CycleTiming>
    where
        S: EthercatSocket,
        F: FnOnce(&mut Master<S>),
    {
        let result = master.cycle_from(start, app);
        match &result {
            Ok(timing) => self.telemetry.publish(timing),
            Err(EthercatError::CycleOverrun {..}) => {
                // the cycle completed, its timing is still meaningful
                self.telemetry.publish(&master.timing());
                self.telemetry.record_overrun();
            },
            Err(error) => {
                self.telemetry.record_error();
                error!("cycle failed: {}", error);
            },
        }
        self.host_tick();
        result
    }

    fn host_tick(&mut self) {
        if self.divider.tick() {
            self.host.forward();
            self.telemetry.record_forwarded();
        }
    }

    /**
        run the master cycles on a dedicated thread, at the control frequency, until [RunningDriver::stop]

        Ticks come from a periodic timer. A cycle ending later than the next ticks skips the ticks it overlapped, they are counted as missed and not caught up. Skipped ticks are still forwarded to the host.
    */
    pub fn spawn<S, F>(mut self, mut master: Master<S>, mut app: F) -> EthercatResult<RunningDriver<S>>
    where
        S: EthercatSocket + Send + 'static,
        F: FnMut(&mut Master<S>) + Send + 'static,
        H: Send + 'static,
    {
        if ! master.is_active()
            {return Err(EthercatError::NotActive)}
        let stop = Arc::new(AtomicBool::new(false));
        let telemetry = self.telemetry.clone();
        let period = self.config.period();
        if period.is_zero()
            {return Err(EthercatError::Master("control frequency too high for the driver timer"))}
        let realtime = self.config.realtime;
        let flag = stop.clone();

        // the timer is polled by a runtime local to the driver thread
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let mut ticker = {
            let _context = runtime.enter();
            Ticker::new(period)?
        };

        let handle = std::thread::Builder::new()
            .name("ethercat-cycle".into())
            .spawn(move || {
                if realtime {
                    raise_priority();
                }
                info!("cycle driver started with period {:?}", period);
                runtime.block_on(async move {
                    let mut last = Instant::now();
                    while ! flag.load(Ordering::Acquire) {
                        if let Err(error) = ticker.wait().await {
                            error!("cycle timer failed: {}", error);
                            break;
                        }
                        if flag.load(Ordering::Acquire)  {break}

                        // one wake may stand for several expirations of the timer
                        let ticks = ((last.elapsed().as_nanos() / period.as_nanos()) as u32).max(1);
                        let deadline = last + period * ticks;
                        last = deadline;
                        if ticks > 1 {
                            let missed = ticks - 1;
                            self.telemetry.record_missed(u64::from(missed));
                            warn!("cycle driver missed {} ticks", missed);
                            for _ in 0 .. missed {
                                self.host_tick();
                            }
                        }
                        // errors are already counted and logged
                        self.tick_from(deadline, &mut master, &mut app).ok();
                    }
                    info!("cycle driver stopped");
                    master
                })
            })?;
        Ok(RunningDriver {stop, handle, telemetry})
    }
}

/// periodic wakeups of the driver thread, from a timerfd where available
#[cfg(target_os = "linux")]
struct Ticker(tokio_timerfd::Interval);
#[cfg(target_os = "linux")]
impl Ticker {
    /// must be called within the runtime that will poll it
    fn new(period: Duration) -> std::io::Result<Self> {
        Ok(Self(tokio_timerfd::Interval::new_interval(period)?))
    }
    async fn wait(&mut self) -> std::io::Result<()> {
        use futures::stream::StreamExt;
        match self.0.next().await {
            Some(result) => result,
            None => Err(std::io::Error::new(std::io::ErrorKind::Other, "timer stream ended")),
        }
    }
}

#[cfg(not(target_os = "linux"))]
struct Ticker(tokio::time::Interval);
#[cfg(not(target_os = "linux"))]
impl Ticker {
    fn new(period: Duration) -> std::io::Result<Self> {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        Ok(Self(interval))
    }
    async fn wait(&mut self) -> std::io::Result<()> {
        self.0.tick().await;
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn raise_priority() {
    if let Err(error) = thread_priority::set_thread_priority_and_policy(
            thread_priority::thread_native_id(),
            thread_priority::ThreadPriority::Max,
            thread_priority::ThreadSchedulePolicy::Realtime(thread_priority::RealtimeThreadSchedulePolicy::Fifo),
            ) {
        warn!("cannot raise cycle driver to realtime priority: {:?}", error);
    }
}
#[cfg(not(target_os = "linux"))]
fn raise_priority() {
    warn!("realtime priority is only supported on linux");
}

/// a [CycleDriver] running on its own thread, owning the master meanwhile
pub struct RunningDriver<S: EthercatSocket> {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<Master<S>>,
    telemetry: Arc<Telemetry>,
}
impl<S: EthercatSocket> RunningDriver<S> {
    pub fn telemetry(&self) -> Arc<Telemetry>  {self.telemetry.clone()}

    /// halt the driver after its current cycle, and give the master back
    pub fn stop(self) -> EthercatResult<Master<S>> {
        self.stop.store(true, Ordering::Release);
        self.handle.join()
            .map_err(|_| EthercatError::Master("cycle driver thread panicked"))
    }
    /// halt the driver, then deactivate and release the master
    pub fn shutdown(self) -> EthercatResult<S> {
        let mut master = self.stop()?;
        master.deactivate();
        Ok(master.release())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn divider() {
        let mut divider = TickDivider::new(4);
        let forwarded = (0 .. 12).filter(|_| divider.tick()).count();
        assert_eq!(forwarded, 3);
        assert!(TickDivider::new(1).tick());
    }

    #[test]
    fn host_ratio() {
        assert_eq!(DriverConfig {control_frequency: 1000, host_frequency: 250, realtime: false}.host_ratio().unwrap(), 4);
        assert!(DriverConfig {control_frequency: 1000, host_frequency: 300, realtime: false}.host_ratio().is_err());
        assert!(DriverConfig {control_frequency: 1000, host_frequency: 0, realtime: false}.host_ratio().is_err());
        assert_eq!(DriverConfig::default().period(), Duration::from_millis(1));
    }

    #[test]
    fn timer_ticks() {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let mut ticker = {
            let _context = runtime.enter();
            Ticker::new(Duration::from_millis(2)).unwrap()
        };
        let start = Instant::now();
        runtime.block_on(async {
            for _ in 0 .. 3 {
                ticker.wait().await.unwrap();
            }
        });
        assert!(start.elapsed() >= Duration::from_millis(5));
    }
}
