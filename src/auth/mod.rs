//! Auth Gate
//! Mission: bearer-token and session-cookie admission for the comparison API.

pub mod gate;
pub mod models;
pub mod store;

pub use gate::{auth_gate, extract_authenticated_user, AuthError};
pub use models::AuthenticatedUser;
pub use store::AuthStore;
