pub mod filters;
pub mod generation;
pub mod worker;
