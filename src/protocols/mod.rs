pub mod messages;
pub mod pairwise;
pub mod params;
pub mod threshold;
