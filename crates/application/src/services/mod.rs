mod message_service;
mod room_registry;
mod user_registry;

pub use message_service::{
    MessageService, MessageServiceDependencies, EDIT_WINDOW, HISTORY_LIMIT,
};
pub use room_registry::{JoinOutcome, LeaveOutcome, RoomRegistry, RoomRegistryDependencies};
pub use user_registry::{
    AuthOutcome, DisconnectOutcome, UserRegistry, UserRegistryDependencies,
};

#[cfg(test)]
mod room_registry_tests;
#[cfg(test)]
mod user_registry_tests;
