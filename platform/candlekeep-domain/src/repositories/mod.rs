pub mod candle_feed;
pub mod candle_store;
pub mod memory;
