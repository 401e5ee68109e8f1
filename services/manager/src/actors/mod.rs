//! Actor runtime and the per-volume actor.

pub mod framework;
pub mod volume;

pub use framework::{Actor, ActorContext, ActorError, ActorHandle, BackoffPolicy, Supervisor};
pub use volume::{VolumeActor, VolumeDeps, VolumeMessage};
