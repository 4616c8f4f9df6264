pub mod frames;
pub mod videos;
