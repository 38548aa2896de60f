pub mod console;
pub mod executor;
pub mod runs;
pub mod transport;
