use crate::{exceptions::ControlSignal, runtime::ThreadContext};

/// What one step of guest execution did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    Continue, // Straight-line progress
    BackEdge, // Loop jumped backwards
    Call,     // Entered a method
    Return,   // Left the outermost frame; execution is done
}

/// Drives a step function on the current guest thread, polling at back-edges
/// and calls and at least every `poll_interval` plain steps.
pub struct Executor<'a> {
    ctx: &'a ThreadContext,
    poll_interval: u32,
    since_poll: u32,
    steps: u64,
}

impl<'a> Executor<'a> {
    pub fn new(ctx: &'a ThreadContext) -> Self {
        let poll_interval = ctx.runtime().config().poll_interval.max(1);
        Self {
            ctx,
            poll_interval,
            since_poll: 0,
            steps: 0,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: u32) -> Self {
        self.poll_interval = poll_interval.max(1);
        self
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Runs `step` until it returns `Return` or an error. An error from
    /// either the step or a safepoint ends the loop.
    pub fn run<E, F>(&mut self, mut step: F) -> Result<u64, E>
    where
        E: From<ControlSignal>,
        F: FnMut(&ThreadContext) -> Result<StepResult, E>,
    {
        loop {
            let result = step(self.ctx)?;
            self.steps += 1;
            match result {
                StepResult::Return => return Ok(self.steps),
                StepResult::BackEdge | StepResult::Call => self.safepoint()?,
                StepResult::Continue => {
                    self.since_poll += 1;
                    if self.since_poll >= self.poll_interval {
                        self.safepoint()?;
                    }
                }
            }
        }
    }

    fn safepoint(&mut self) -> Result<(), ControlSignal> {
        self.since_poll = 0;
        self.ctx.poll()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::ControlConfig, runtime::ThreadOutcome, Runtime};

    #[test]
    fn test_polls_at_back_edges_and_interval() {
        let runtime = Runtime::new(ControlConfig::default());
        let thread = runtime.create_thread("loop");
        let handle = runtime
            .start(&thread, |ctx| {
                let before = ctx.runtime().metrics().safepoint_polls;
                let mut n = 0;
                let steps = Executor::new(ctx).with_poll_interval(4).run(|_| {
                    n += 1;
                    Ok::<_, ControlSignal>(match n {
                        1..=8 => StepResult::Continue,
                        9 => StepResult::BackEdge,
                        10 => StepResult::Call,
                        _ => StepResult::Return,
                    })
                })?;
                assert_eq!(steps, 11);
                // Two interval polls, one back-edge, one call
                assert_eq!(ctx.runtime().metrics().safepoint_polls - before, 4);
                Ok(())
            })
            .unwrap();
        assert_eq!(handle.join().unwrap(), ThreadOutcome::Completed);
    }

    #[test]
    fn test_kill_ends_infinite_loop() {
        let runtime = Runtime::new(ControlConfig::default());
        let thread = runtime.create_thread("spin");
        let (running_tx, running_rx) = std::sync::mpsc::channel();
        let handle = runtime
            .start(&thread, move |ctx| {
                running_tx.send(()).unwrap();
                Executor::new(ctx).run(|_| Ok::<_, ControlSignal>(StepResult::BackEdge))?;
                Ok(())
            })
            .unwrap();
        running_rx.recv().unwrap();
        runtime.kill(&thread).unwrap();
        assert!(matches!(
            handle.join().unwrap(),
            ThreadOutcome::Killed { .. }
        ));
    }
}
