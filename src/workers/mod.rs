pub mod scheduler;
pub mod transcoder;
