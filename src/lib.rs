//! A real-time model railroad dispatch system.
//!
//! Several trains share one track. The controller reports nothing but
//! anonymous contact closures, so the pipeline here attributes each trip
//! to a train, estimates per-train position and velocity from the trip
//! stream, plans shortest paths (with a reverse manoeuvre when that is
//! cheaper), throws turnouts just ahead of each train, and cuts power at
//! the exact moment a coasting train will come to rest on its goal.
//!
//! Every stage is a server task owning its state, fed in arrival order
//! through a bounded inbox; one-way event streams are broadcast buses
//! bridged into inboxes by small notifier tasks. See
//! [`control::dispatch::Dispatch`] for the whole plant, wired.

/// Shared scalar types, unit conventions and constants.
pub mod general;
/// Inboxes, buses, the tick clock and the name registry.
pub mod runtime;
/// The train control pipeline.
pub mod control;

pub use control::dispatch::{Dispatch, DispatchConfig};
pub use control::track::data::{track, Layout};
pub use general::TrainId;
