pub mod guard;
pub mod store;

pub use guard::TokenGuard;
pub use store::{AuthStore, InMemoryAuthStore};
