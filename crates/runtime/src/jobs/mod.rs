mod poll;
mod sweep;
mod sync;

pub use poll::PollJob;
pub use sweep::SweepJob;
pub use sync::SyncJob;
