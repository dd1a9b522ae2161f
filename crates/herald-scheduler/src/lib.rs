//! `herald-scheduler`: deferred message dispatch with SQLite persistence.
//!
//! # Overview
//!
//! Callers schedule a message for a future instant through
//! [`service::ScheduleService`]. Rows live in the `scheduled_messages`
//! table; a [`dispatcher::Dispatcher`] polls for due rows, claims each one
//! with a conditional update and hands it to a [`sender::MessageSender`].
//! A [`sweep::StuckSweeper`] returns rows whose claimant died mid-send to the
//! pool.
//!
//! # Status lifecycle
//!
//! | From      | To        | Who                                   |
//! |-----------|-----------|---------------------------------------|
//! | `pending` | `sending` | dispatcher claim / run now            |
//! | `sending` | `sent`    | send succeeded                        |
//! | `sending` | `failed`  | send failed or timed out              |
//! | `sending` | `pending` | stuck sweep                           |
//! | `failed`  | `pending` | explicit update                       |
//!
//! The database is the only synchronisation point: any number of
//! dispatchers, in one process or many, may share it.

pub mod clock;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod sender;
pub mod service;
pub mod store;
pub mod sweep;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatcher::{DispatchOptions, Dispatcher, TickReport};
pub use error::{Result, SchedulerError, SendError};
pub use sender::{MessageSender, UnavailableSender};
pub use service::ScheduleService;
pub use store::MessageStore;
pub use sweep::{StuckSweeper, SweepOptions, SweepReport};
pub use types::{MessagePayload, MessageStatus, OutboundMessage, RunOutcome, ScheduledMessage};
