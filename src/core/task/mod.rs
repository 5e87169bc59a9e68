pub mod events;
pub mod lifecycle;
pub mod state;

pub use events::{ProgressHub, TaskEvent};
pub use lifecycle::{progress_percent, ProcessingTask, TaskController, TaskStore};
pub use state::TaskStatus;
