pub mod error;
pub mod repos;
pub mod status;
