pub mod clock;
pub mod telemetry;
pub mod throttle;

pub use clock::*;
pub use telemetry::*;
pub use throttle::*;
