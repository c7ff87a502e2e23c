pub mod logging;
pub mod scenario;
