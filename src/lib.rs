pub mod api;
pub mod certsign;
pub mod classify;
pub mod config;
pub mod error;
pub mod events;
pub mod exec;
pub mod logbuf;
pub mod notifications;
pub mod puppet;
pub mod state;
