pub mod migrations;
pub mod postgres_candles;
