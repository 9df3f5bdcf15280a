pub mod catalogue;
pub mod conditions;
pub mod events;
pub mod project;
pub mod protocol;
pub mod store;
