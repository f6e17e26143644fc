pub mod clients;
pub mod compose;
pub mod models;
pub mod senders;
pub mod service;
