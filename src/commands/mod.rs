pub mod analyze;
pub mod monte_carlo;
pub mod optimize;
pub mod walk_forward;
