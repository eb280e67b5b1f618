// StationCast Models
// Data structures shared by the supervisor and the control server

mod station;
mod pipeline_status;
mod settings;

pub use station::*;
pub use pipeline_status::*;
pub use settings::*;
