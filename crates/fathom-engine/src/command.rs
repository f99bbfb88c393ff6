//! The suspendable command framework.
//!
//! One command object per in-flight protocol operation. `process` advances
//! the command by one protocol exchange and reports how the chain should
//! proceed via [`Flow`]; suspension (waiting on a consumer decision) is an
//! explicit return value, never a blocking wait. Commands compose through
//! the per-session [`CommandChain`]: a frame may push a sub-command on its
//! own behalf and is resumed once that sub-command completes with
//! [`ResultCode::Ok`]; any other terminal code tears the whole chain down,
//! running each frame's `cleanup` exactly once.

use async_trait::async_trait;

/// Terminal outcome of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Ok,
    UserAbort,
    Failed,
    /// Failed, but the failure was expected (an internal probe) and must
    /// not surface as an error event.
    FailedSilently,
}

/// What the chain should do after one `process`/`wakeup` step.
pub enum Flow<C: Send> {
    /// More steps to run; schedule the next one on the next tick.
    Continue,
    /// Waiting on an external decision; resume via `wakeup`.
    Suspended,
    /// Push a sub-command; this frame resumes when it completes Ok.
    Chain(Box<dyn Command<C>>),
    /// Terminal.
    Done(ResultCode),
}

/// One protocol operation as a suspendable state machine.
///
/// `&mut self` receivers make a step non-reentrant by construction; the
/// chain owns every frame, so destruction can never race a running step.
#[async_trait]
pub trait Command<C: Send>: Send {
    /// Short operation name, used in logs.
    fn name(&self) -> &'static str;

    /// Advance by one protocol exchange. Must not busy-block: long waits
    /// are awaited I/O, decisions are a `Flow::Suspended` return.
    async fn process(&mut self, ctx: &mut C) -> Flow<C>;

    /// Resume after an external decision. The default re-enters `process`
    /// with the event attached to the context by the caller.
    async fn wakeup(&mut self, ctx: &mut C, event: fathom_core::WakeupEvent) -> Flow<C> {
        let _ = event;
        self.process(ctx).await
    }

    /// Release held resources. Runs exactly once per frame, on normal
    /// completion and on unwind alike.
    async fn cleanup(&mut self, ctx: &mut C) {
        let _ = ctx;
    }
}

/// Chain status reported to the session driver after each step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainStatus {
    /// A step ran; schedule another.
    Running,
    /// Top frame is waiting on a wakeup.
    Suspended,
    /// The chain emptied with this terminal code.
    Finished(ResultCode),
    /// Nothing to run.
    Idle,
}

struct Frame<C: Send> {
    cmd: Box<dyn Command<C>>,
    clean: bool,
}

/// Per-session stack of command frames; top of stack is "current".
pub struct CommandChain<C: Send> {
    frames: Vec<Frame<C>>,
}

impl<C: Send> Default for CommandChain<C> {
    fn default() -> Self {
        Self { frames: Vec::new() }
    }
}

impl<C: Send> CommandChain<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn current_name(&self) -> Option<&'static str> {
        self.frames.last().map(|f| f.cmd.name())
    }

    /// Start a fresh top-level operation. Only valid on an empty chain;
    /// the session serializes submissions.
    pub fn start(&mut self, cmd: Box<dyn Command<C>>) {
        debug_assert!(self.frames.is_empty(), "chain already busy");
        log::debug!("command start: {}", cmd.name());
        self.frames.push(Frame { cmd, clean: false });
    }

    /// Run one step of the top frame.
    pub async fn step(&mut self, ctx: &mut C) -> ChainStatus {
        let Some(frame) = self.frames.last_mut() else {
            return ChainStatus::Idle;
        };
        let flow = frame.cmd.process(ctx).await;
        self.apply(ctx, flow).await
    }

    /// Deliver a decision to the top frame and run its resumption step.
    pub async fn wakeup(&mut self, ctx: &mut C, event: fathom_core::WakeupEvent) -> ChainStatus {
        let Some(frame) = self.frames.last_mut() else {
            return ChainStatus::Idle;
        };
        let flow = frame.cmd.wakeup(ctx, event).await;
        self.apply(ctx, flow).await
    }

    /// Tear the whole chain down with `UserAbort`, running each frame's
    /// cleanup exactly once, innermost first.
    pub async fn abort(&mut self, ctx: &mut C) {
        while let Some(mut frame) = self.frames.pop() {
            if !frame.clean {
                frame.cmd.cleanup(ctx).await;
                frame.clean = true;
            }
        }
    }

    async fn apply(&mut self, ctx: &mut C, flow: Flow<C>) -> ChainStatus {
        match flow {
            Flow::Continue => ChainStatus::Running,
            Flow::Suspended => ChainStatus::Suspended,
            Flow::Chain(sub) => {
                log::debug!("command chain: {}", sub.name());
                self.frames.push(Frame {
                    cmd: sub,
                    clean: false,
                });
                // Deferred: the sub-command's first step runs on the next
                // tick, never by recursing here.
                ChainStatus::Running
            }
            Flow::Done(code) => {
                if let Some(mut frame) = self.frames.pop() {
                    if !frame.clean {
                        frame.cmd.cleanup(ctx).await;
                        frame.clean = true;
                    }
                }
                match code {
                    ResultCode::Ok => {
                        if self.frames.is_empty() {
                            ChainStatus::Finished(ResultCode::Ok)
                        } else {
                            // Parent resumes on the next tick.
                            ChainStatus::Running
                        }
                    }
                    other => {
                        // Propagate-on-failure: unwind every enclosing frame.
                        while let Some(mut frame) = self.frames.pop() {
                            if !frame.clean {
                                frame.cmd.cleanup(ctx).await;
                                frame.clean = true;
                            }
                        }
                        ChainStatus::Finished(other)
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Ctx;

    /// Chains `remaining` children below itself, then fails (or succeeds)
    /// at the bottom.
    struct Nester {
        remaining: usize,
        bottom: ResultCode,
        stepped: bool,
        cleanups: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Command<Ctx> for Nester {
        fn name(&self) -> &'static str {
            "nester"
        }

        async fn process(&mut self, _ctx: &mut Ctx) -> Flow<Ctx> {
            if !self.stepped && self.remaining > 0 {
                self.stepped = true;
                return Flow::Chain(Box::new(Nester {
                    remaining: self.remaining - 1,
                    bottom: self.bottom,
                    stepped: false,
                    cleanups: Arc::clone(&self.cleanups),
                }));
            }
            if self.remaining == 0 && !self.stepped {
                self.stepped = true;
                return Flow::Done(self.bottom);
            }
            // Resumed after the child finished Ok.
            Flow::Done(ResultCode::Ok)
        }

        async fn cleanup(&mut self, _ctx: &mut Ctx) {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn drive(chain: &mut CommandChain<Ctx>, ctx: &mut Ctx) -> ChainStatus {
        loop {
            match chain.step(ctx).await {
                ChainStatus::Running => continue,
                other => return other,
            }
        }
    }

    #[tokio::test]
    async fn ok_chain_resumes_parents_and_cleans_each_frame_once() {
        let cleanups = Arc::new(AtomicUsize::new(0));
        let mut chain = CommandChain::new();
        let mut ctx = Ctx;
        chain.start(Box::new(Nester {
            remaining: 3,
            bottom: ResultCode::Ok,
            stepped: false,
            cleanups: Arc::clone(&cleanups),
        }));
        assert_eq!(
            drive(&mut chain, &mut ctx).await,
            ChainStatus::Finished(ResultCode::Ok)
        );
        assert!(chain.is_empty());
        // 4 frames (depth 3 + root), one cleanup each.
        assert_eq!(cleanups.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn failure_unwinds_the_whole_chain_with_the_same_code() {
        let cleanups = Arc::new(AtomicUsize::new(0));
        let mut chain = CommandChain::new();
        let mut ctx = Ctx;
        chain.start(Box::new(Nester {
            remaining: 2,
            bottom: ResultCode::Failed,
            stepped: false,
            cleanups: Arc::clone(&cleanups),
        }));
        assert_eq!(
            drive(&mut chain, &mut ctx).await,
            ChainStatus::Finished(ResultCode::Failed)
        );
        assert!(chain.is_empty());
        assert_eq!(cleanups.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn abort_runs_exactly_depth_cleanups() {
        let cleanups = Arc::new(AtomicUsize::new(0));
        let mut chain = CommandChain::new();
        let mut ctx = Ctx;
        chain.start(Box::new(Nester {
            remaining: 5,
            bottom: ResultCode::Ok,
            stepped: false,
            cleanups: Arc::clone(&cleanups),
        }));
        // Build the chain up to full depth without letting the bottom run.
        for _ in 0..5 {
            assert_eq!(chain.step(&mut ctx).await, ChainStatus::Running);
        }
        let depth = chain.depth();
        assert_eq!(depth, 6);
        chain.abort(&mut ctx).await;
        assert!(chain.is_empty());
        assert_eq!(cleanups.load(Ordering::SeqCst), depth);
    }

    #[tokio::test]
    async fn empty_chain_is_idle() {
        let mut chain: CommandChain<Ctx> = CommandChain::new();
        let mut ctx = Ctx;
        assert_eq!(chain.step(&mut ctx).await, ChainStatus::Idle);
    }

    struct Suspender {
        woken: bool,
    }

    #[async_trait]
    impl Command<Ctx> for Suspender {
        fn name(&self) -> &'static str {
            "suspender"
        }

        async fn process(&mut self, _ctx: &mut Ctx) -> Flow<Ctx> {
            if self.woken {
                Flow::Done(ResultCode::Ok)
            } else {
                Flow::Suspended
            }
        }

        async fn wakeup(
            &mut self,
            ctx: &mut Ctx,
            _event: fathom_core::WakeupEvent,
        ) -> Flow<Ctx> {
            self.woken = true;
            self.process(ctx).await
        }
    }

    #[tokio::test]
    async fn suspension_resumes_via_wakeup() {
        let mut chain = CommandChain::new();
        let mut ctx = Ctx;
        chain.start(Box::new(Suspender { woken: false }));
        assert_eq!(chain.step(&mut ctx).await, ChainStatus::Suspended);
        assert_eq!(chain.step(&mut ctx).await, ChainStatus::Suspended);
        let status = chain
            .wakeup(
                &mut ctx,
                fathom_core::WakeupEvent::PeerVerify(true),
            )
            .await;
        assert_eq!(status, ChainStatus::Finished(ResultCode::Ok));
    }
}
