mod actor;
mod config;
mod dual_write;
mod error;
mod eval;
mod feature;
mod gate;
mod http;
mod instrument;
mod memory;
mod pull;
mod snapshot;
mod store;
mod synchronizer;
mod test_common;
mod util;

pub use actor::*;
pub use config::*;
pub use dual_write::*;
pub use error::*;
pub use eval::*;
pub use feature::*;
pub use gate::*;
pub use http::*;
pub use instrument::*;
pub use memory::*;
pub use pull::*;
pub use snapshot::*;
pub use store::*;
pub use synchronizer::*;
