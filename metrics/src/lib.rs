pub mod counter;

pub use crate::counter::Counter;
