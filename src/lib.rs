//! Autonomous playlist streaming into a Discord voice channel.
//!
//! The crate is split leaves first: [`manifest`] loads the track list,
//! [`source`] turns identifiers into playable inputs, [`transcode`] runs the
//! external decoder, [`controller`] is the playback state machine,
//! [`runtime`] drives it, and [`voice`] is the songbird/serenity glue.

pub mod config;
pub mod controller;
pub mod error;
pub mod manifest;
pub mod runtime;
pub mod source;
pub mod transcode;
pub mod voice;

pub use error::{BotError, Result};
