mod driver;
mod items;
mod state_machine;

pub use state_machine::Commit;
pub use state_machine::StateMachine;

pub(crate) use driver::StateMachineDriver;
pub(crate) use items::ApplyCompletion;
pub(crate) use items::ApplyItem;
pub(crate) use items::DriverClient;
pub(crate) use items::DriverFeedback;
pub(crate) use items::QueryCompletion;
