//! # ragwatch-session — operator-facing glue
//!
//! [`SessionController`] owns the working event set for one watched session,
//! feeds it from a [`ragwatch_stream::StreamClient`], and republishes a
//! [`SessionView`] through a watch channel. Clearing and reloading history go
//! through a [`ragwatch_protocol::HistoryPort`], normally [`HttpHistoryClient`].

pub mod controller;
pub mod history;
pub mod view;

pub use controller::SessionController;
pub use history::{HistoryConfig, HistoryError, HttpHistoryClient};
pub use view::SessionView;
