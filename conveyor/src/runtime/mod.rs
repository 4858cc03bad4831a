/// Builder for constructing a [`QueueManager`].
pub mod builder;
/// The public engine handle.
pub mod manager;
/// Worker pools, housekeeping and shutdown.
pub mod supervisor;
mod worker;

pub use builder::QueueManagerBuilder;
pub use manager::QueueManager;
pub use supervisor::ShutdownToken;
