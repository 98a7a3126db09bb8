#![deny(missing_docs)]
//! Telegram transport adapter for the bot fleet broadcast engine.

/// Worker runtime entrypoint.
pub mod runner;
/// Telegram Bot API transport and connector.
pub mod transport;

pub use transport::{TelegramConnector, TelegramTransport};
