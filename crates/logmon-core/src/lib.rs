pub mod coordinator;
pub mod error;
pub mod events;

pub use coordinator::{to_target, Coordinator, CoordinatorOptions, Selection};
pub use error::CoreError;
pub use events::{Pane, Update, UpdateDispatcher, UpdateReceiver};
