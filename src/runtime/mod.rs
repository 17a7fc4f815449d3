/// Publish/subscribe buses backing every `*_await` style API.
pub mod bus;
/// The tick clock: time, delay and delay-until over a 10 ms timer.
pub mod clock;
/// Bounded request inboxes with rendezvous replies.
pub mod ipc;
/// The name registry servers register themselves with at startup.
pub mod registry;
