pub mod candle;
pub mod collection;
pub mod interval;
pub mod overlap;
pub mod range;
pub mod request;
