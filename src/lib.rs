//! sgtsync subscribes to a pxGrid session topic and mirrors SGT/IP bindings
//! into a network-analytics console's host groups, one group per tag name.
//! A local cache keeps repeated bindings from turning into repeated console
//! writes; a sliding-window meter sheds events when the console call budget
//! is exhausted; a periodic sweep retires IPs the identity source stopped
//! confirming.
pub mod cache;
pub mod cli;
pub mod console;
pub mod controller;
pub mod directory;
pub mod error;
pub mod events;
pub mod pxgrid;
pub mod rate_meter;
pub mod settings;
pub mod stomp;
pub mod sweep;
