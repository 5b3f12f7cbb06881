//! Background polling of beamline devices.
//!
//! A [`Poller`] runs one worker task per device of a poller group. Each
//! worker creates its device lazily, polls it at an adaptive interval and
//! publishes `value` and `status` into the shared cache. In master mode a
//! [`Supervisor`] keeps one child process per group running.

mod poller;
mod supervisor;
mod worker;

pub use poller::Poller;
pub use supervisor::{ChildExit, ExitReason, ProcessManager, Supervisor, TokioProcessManager};
pub use worker::{PollSchedule, WorkerState};
