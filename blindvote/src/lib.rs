#[macro_use]
extern crate serde;

mod blind;
mod client;
mod config;
mod dispatcher;
mod ecies_ed25519;
mod election;
mod envelope;
mod error;
mod event;
mod message;
mod relay;
mod serde_hex;
mod session;
mod storage;
mod subscription;
mod util;
mod vote;

pub use blind::*;
pub use client::*;
pub use config::*;
pub use dispatcher::*;
pub use election::*;
pub use envelope::*;
pub use error::*;
pub use event::*;
pub use message::*;
pub use relay::*;
pub use serde_hex::*;
pub use session::*;
pub use storage::*;
pub use subscription::*;
pub use util::*;
pub use vote::*;
