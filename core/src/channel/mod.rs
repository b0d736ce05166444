//! Message channels
//!
//! Public channels fan out over direct links and the relay graph and are
//! merged back into one timeline. Private messages are sealed for one
//! recipient and parked in their relay inbox. Session streams are encrypted
//! to the author's own identity so every device of that identity can follow.

pub mod hub;
pub mod timeline;
pub mod types;

pub use hub::{ChannelHub, DeliveryReport, PublicChannel};
pub use timeline::Timeline;
pub use types::{validate_channel_name, ChannelError, ChannelFrame, PrivateMessage, PublicMessage, SealedMessage, SessionMessage};
