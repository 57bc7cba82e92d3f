pub mod frame;
pub mod payload;
pub mod sequence;
