pub mod context;
pub mod errors;
pub mod events;
pub mod ids;
pub mod params;
