pub mod clock;
pub mod sequence;
