pub mod capture;
pub mod config;
pub mod egress;
pub mod encap;
pub mod lisp;
pub mod map_cache;
pub mod packet;
pub mod punt;
pub mod registry;
pub mod test_util;
pub mod worker;

pub use config::{ItrConfig, StaticMapping};
pub use map_cache::{MapCache, MapEntry, Rloc, RlocKey};
pub use punt::{PuntMessage, punt_channel};
pub use registry::{EidRegistry, InterfaceRegistry};
pub use worker::{WorkerContext, WorkerHandle, spawn, spawn_af_packet};
