//! Input sources.
//!
//! Each source owns an [`IntentSender`](crate::intent::IntentSender) obtained
//! from [`InputArbiter::register_source`](crate::arbiter::InputArbiter::register_source)
//! and never touches joint state directly.

pub mod gamepad;
pub mod key_sequence;
pub mod keyboard;
pub mod leader;
pub mod replay;
