pub mod tasks;

pub use tasks::{
    GenerateStoryCommand, RunId, RunInputs, RunReport, TaskController, TaskError, TaskEvent,
    TaskSendError,
};
