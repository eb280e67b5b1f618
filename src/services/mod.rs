// StationCast Services
// Pipeline supervision and its supporting layers

mod events;
mod station_paths;
mod station_store;
mod settings_manager;
mod log_manager;
mod playlist;
mod overlay;
mod text_capability;
mod now_playing;
mod launch_args;
mod log_router;
mod pipeline_supervisor;

pub use events::*;
pub use station_paths::*;
pub use station_store::*;
pub use settings_manager::*;
pub use log_manager::*;
pub use playlist::*;
pub use overlay::*;
pub use text_capability::*;
pub use now_playing::*;
pub use launch_args::*;
pub use log_router::*;
pub use pipeline_supervisor::*;
