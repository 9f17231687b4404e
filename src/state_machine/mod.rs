mod retry;
mod state;
mod task;

pub use retry::RetryPolicy;
pub use state::{StateMachine, Transition};
pub use task::{ScoreReport, Task, TaskOutcome, TaskState};
