//! The side of the protocol running inside the checked process.

use nix::sys::{
    ptrace,
    signal::{self, Signal},
};

use crate::{
    channel::Channel,
    protocol::{Message, ProtocolError, TaskId},
};

/// The scheduler of the checked process, driven by the [Agent].
pub trait Scheduler {
    /// Run every runnable task until all of them are blocked.
    fn run_until_next_blocking_point(&mut self);

    fn is_task_enabled(&self, task: TaskId) -> bool;

    /// Complete the pending blocking call of `task` with `value`.
    ///
    /// Returns `false` if `task` is unknown.
    fn force_complete_blocking_call(&mut self, task: TaskId, value: i32) -> bool;

    fn live_tasks(&self) -> Vec<TaskId>;

    /// Map the privatized data segment with `index` as the active one.
    fn switch_private_segment(&mut self, _index: u64) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    WaitingForCommand,
    RunningScheduler,
}

pub struct Agent<S> {
    channel: Channel,
    scheduler: S,
    state: AgentState,
}

impl<S: Scheduler> Agent<S> {
    pub fn new(channel: Channel, scheduler: S) -> Self {
        Self { channel, scheduler, state: AgentState::WaitingForCommand }
    }

    /// Connect to the controller named by the environment and wait for it to attach.
    ///
    /// Returns `None` if the process was not started by a controller.
    pub fn initialize(scheduler: S) -> Result<Option<Self>, ProtocolError> {
        let channel = match Channel::from_env()? {
            Some(channel) => channel,
            None => return Ok(None),
        };

        ptrace::traceme()?;
        signal::raise(Signal::SIGSTOP)?;
        tracing::info!("controller attached");

        Ok(Some(Self::new(channel, scheduler)))
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut S {
        &mut self.scheduler
    }

    /// Answer requests from the controller until it asks the process to continue.
    pub fn handle_messages(&mut self) -> Result<(), ProtocolError> {
        self.state = AgentState::WaitingForCommand;
        loop {
            let message = self.channel.receive()?;
            tracing::debug!("Received {}", message.kind());
            if !self.handle_message(message)? {
                return Ok(());
            }
        }
    }

    /// Handle a single request, returns `false` once the controller asked to continue.
    fn handle_message(&mut self, message: Message) -> Result<bool, ProtocolError> {
        match message {
            Message::Continue => return Ok(false),
            Message::DeadlockCheck => {
                let tasks = self.scheduler.live_tasks();
                let deadlock =
                    !tasks.is_empty() && tasks.iter().all(|t| !self.scheduler.is_task_enabled(*t));
                self.channel.send(&Message::DeadlockCheckReply(deadlock))?;
            }
            Message::SimcallHandle { task, value } => {
                if !self.scheduler.force_complete_blocking_call(task, value) {
                    return Err(ProtocolError::UnknownTask(task));
                }
                self.channel.send(&Message::Waiting)?;
            }
            Message::ActorEnabled(task) => {
                let enabled = self.scheduler.is_task_enabled(task);
                self.channel.send(&Message::ActorEnabledReply(enabled))?;
            }
            Message::Restore(index) => self.scheduler.switch_private_segment(index),
            other => {
                return Err(ProtocolError::UnexpectedMessage {
                    expected: "a controller request",
                    received: other.kind(),
                })
            }
        }
        Ok(true)
    }

    /// Wait for the controller to continue the process, then run the scheduler until every task
    /// is blocked.
    pub fn step(&mut self) -> Result<(), ProtocolError> {
        self.handle_messages()?;

        self.state = AgentState::RunningScheduler;
        self.scheduler.run_until_next_blocking_point();
        self.channel.send(&Message::Waiting)?;
        self.state = AgentState::WaitingForCommand;
        Ok(())
    }

    pub fn main_loop(&mut self) -> ! {
        loop {
            if let Err(e) = self.step() {
                fatal(e);
            }
        }
    }

    /// Notify the controller that a property was violated, then serve its requests.
    pub fn report_assertion_failure(&mut self) -> Result<(), ProtocolError> {
        self.channel.send(&Message::AssertionFailed)?;
        self.handle_messages()
    }
}

/// Abort the checked process after a protocol failure.
pub fn fatal(error: impl std::fmt::Display) -> ! {
    tracing::error!("{error}");
    eprintln!("[mcheck] {error}");
    std::process::abort()
}
