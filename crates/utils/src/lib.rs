pub mod log;
pub mod phone;
pub mod response;
