pub mod collector;
pub mod continuity;
pub mod filler;
pub mod overlap;
pub mod planner;
pub mod resolver;
