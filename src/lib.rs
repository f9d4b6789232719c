pub mod auth;
pub mod config;
pub mod conversation;
pub mod dispatch;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod session;
pub mod stream;
pub mod transport;
pub mod widget;
