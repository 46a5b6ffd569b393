pub mod cordic;
pub mod profile;
