//! Application layer: the payment flows and the machinery they share.
//!
//! Every flow owns a [`scope::TaskScope`] for its background work and a
//! [`state::StateCell`] holding its latest state. Hosts drive a flow through
//! its methods and observe it through `state()` / `subscribe()`.

pub mod authorize;
pub mod card;
pub mod handoff;
pub mod poller;
pub mod process;
pub mod recurrent;
pub mod scope;
pub mod session;
pub mod state;
pub mod token_wallet;
