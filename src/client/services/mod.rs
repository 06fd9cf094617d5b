pub mod conversation_sync;
pub mod events;
pub mod group_sync;
pub mod notifications;
pub mod offline;
pub mod presence;
pub mod reconcile;
pub mod rest;
pub mod transport;
