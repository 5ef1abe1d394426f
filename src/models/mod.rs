pub mod chunk;
pub mod upload;
