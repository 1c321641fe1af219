pub mod feed;
pub mod persistence;
