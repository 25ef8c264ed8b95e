pub mod annotate;
pub mod color;
pub mod image;
pub mod search;
pub mod similarity;
pub mod thumbnail;
pub mod vision;
