pub mod password;
pub mod secrets;
pub mod validation;

pub use password::{hash_password, verify_password, Password, PasswordHashString};
pub use secrets::{random_token, secret_matches, sha256_hex};
pub use validation::ValidatedJson;
