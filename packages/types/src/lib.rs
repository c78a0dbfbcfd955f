mod admission;
mod agent;
mod events;
mod frames;
mod id;
mod result;
mod run;
mod service;
mod shard;

pub use admission::*;
pub use agent::*;
pub use events::*;
pub use frames::*;
pub use id::*;
pub use result::*;
pub use run::*;
pub use service::*;
pub use shard::*;
