pub mod response;
pub mod scratch;
pub mod upload;
