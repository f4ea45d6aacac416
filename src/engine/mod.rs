pub mod event;
pub mod executor;
pub mod forms;
pub mod machine;
pub mod state;
pub mod waiting;
