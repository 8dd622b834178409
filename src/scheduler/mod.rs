pub mod fallback;
pub mod runner;
pub mod state;
pub mod wake;
pub mod watchdog;

pub use runner::Scheduler;
