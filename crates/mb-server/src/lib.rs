pub mod rest;
pub mod state;

pub use rest::create_router;
pub use state::AppState;
