pub mod candles;
pub mod config;
