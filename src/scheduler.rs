/*!
    cyclic exchange of process data and mailbox datagrams

    Every cycle, the master sends the queued datagrams, receives their answers, synchronizes the domains and runs the application. Two orderings are possible, see [Strategy].
*/

use crate::{
    master::Master,
    socket::EthercatSocket,
    error::{EthercatError, EthercatResult},
    };
use core::time::Duration;
use std::time::Instant;
use log::{trace, warn};


/// ordering of a cycle's exchanges
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum Strategy {
    /**
        queue, send, wait for the answer, process, then run the application

        The application sees data answering the request of the same cycle, but the cycle lasts the whole bus round trip.
    */
    #[default]
    Synchronous,
    /**
        receive and process the answer to the previous cycle's request, run the application, then queue and send right away

        The round trip is hidden behind one period, at the cost of one cycle of staleness: data processed in cycle `n` answers the request sent in cycle `n-1`. Processing overwrites the whole exchange buffer, so outputs must be written by the application during the cycle.
    */
    Asynchronous,
}

/// step of the cycle state machine
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum CyclePhase {
    /// between cycles
    #[default]
    Idle,
    /// queueing and sending datagrams
    Sending,
    /// waiting for answers
    AwaitingReceive,
    /// synchronizing domains and running the application
    Processing,
}

/// timing measurements of one cycle, each one being the time elapsed since the cycle start
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct CycleTiming {
    /// when the exchanges started
    pub pre_io: Duration,
    /// when exchanges, domain synchronization and application were over
    pub post_io: Duration,
    /// when the cycle ended
    pub finished: Duration,
}

impl<S: EthercatSocket> Master<S> {
    /**
        run one cycle: exchange datagrams with the segment, synchronize domains, and run `app` in between.

        `app` is called exactly once, when the domains exchange buffers are up to date and can be read and written. It can also start mailbox exchanges, they are sent in this cycle or the next one depending on the [Strategy].

        A cycle exceeding its time budget, or waiting longer than the round trip time for its answers, returns [EthercatError::CycleOverrun]. The cycle is nonetheless complete and the domains are consistent.
    */
    pub fn cycle<F>(&mut self, app: F) -> EthercatResult<CycleTiming>
    where F: FnOnce(&mut Self)
    {
        self.cycle_from(Instant::now(), app)
    }

    /// same as [Self::cycle], but timings are measured from `start`, usually the moment the cycle was due
    pub fn cycle_from<F>(&mut self, start: Instant, app: F) -> EthercatResult<CycleTiming>
    where F: FnOnce(&mut Self)
    {
        if ! self.is_active()
            {return Err(EthercatError::NotActive)}
        let pre_io = start.elapsed();

        let overrun = match self.config.strategy {
            Strategy::Synchronous => self.synchronous(app),
            Strategy::Asynchronous => self.asynchronous(app),
        };
        let overrun = match overrun {
            Ok(overrun) => overrun,
            Err(error) => {
                // datagrams not sent stay queued for the next cycle
                self.phase = CyclePhase::Idle;
                return Err(error);
            },
        };
        let post_io = start.elapsed();

        self.cycles += 1;
        self.phase = CyclePhase::Idle;
        let finished = start.elapsed();
        self.timing = CycleTiming {pre_io, post_io, finished};
        trace!("cycle {} {:?}", self.cycles, self.timing);

        if let Some(budget) = self.config.cycle_budget {
            if finished > budget {
                warn!("cycle {} overrun: {:?} for a budget of {:?}", self.cycles, finished, budget);
                return Err(EthercatError::CycleOverrun {elapsed: finished, budget});
            }
        }
        if let Some(elapsed) = overrun {
            warn!("cycle {} waited {:?} for its answers, beyond the round trip budget", self.cycles, elapsed);
            return Err(EthercatError::CycleOverrun {elapsed, budget: self.config.round_trip});
        }
        Ok(self.timing)
    }

    /// returns the time waited for answers if some did not come back in time
    fn synchronous<F>(&mut self, app: F) -> EthercatResult<Option<Duration>>
    where F: FnOnce(&mut Self)
    {
        self.phase = CyclePhase::Sending;
        self.queue_all()?;
        self.transport.send()?;

        self.phase = CyclePhase::AwaitingReceive;
        let timed_out = self.transport.stats().datagrams_timed_out;
        let waiting = Instant::now();
        self.transport.receive(self.config.round_trip)?;
        let waited = waiting.elapsed();
        let late = self.transport.stats().datagrams_timed_out != timed_out;

        self.phase = CyclePhase::Processing;
        self.process_all()?;
        self.advance_exchanges();
        app(self);

        Ok(late.then_some(waited))
    }

    fn asynchronous<F>(&mut self, app: F) -> EthercatResult<Option<Duration>>
    where F: FnOnce(&mut Self)
    {
        // frames sent by the previous cycle are back since long, no need to wait
        self.phase = CyclePhase::AwaitingReceive;
        self.transport.receive(Duration::ZERO)?;

        self.phase = CyclePhase::Processing;
        self.process_all()?;
        self.advance_exchanges();
        app(self);
        // the application may have stopped everything
        if ! self.is_active()
            {return Ok(None)}

        self.phase = CyclePhase::Sending;
        self.queue_all()?;
        self.transport.send()?;
        Ok(None)
    }

    fn queue_all(&mut self) -> EthercatResult {
        for domain in self.domains.iter_mut() {
            domain.queue(&mut self.transport)?;
        }
        self.issue_exchanges();
        Ok(())
    }
    fn process_all(&mut self) -> EthercatResult {
        for domain in self.domains.iter_mut() {
            domain.process(&self.transport)?;
        }
        Ok(())
    }
}
