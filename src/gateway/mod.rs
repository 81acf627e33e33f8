//! Gateway shared state

pub mod state;

pub use state::AppState;
