pub mod router;
pub mod state;
pub mod survey;
pub mod templates;

pub use state::AppState;
