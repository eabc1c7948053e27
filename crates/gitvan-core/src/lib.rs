pub mod canon;
pub mod config;
pub mod error;
pub mod ids;
pub mod names;
pub mod time;
pub mod types;

pub use canon::*;
pub use config::*;
pub use error::*;
pub use ids::*;
pub use names::*;
pub use time::*;
pub use types::*;
