pub mod filters;
pub mod movie;
pub mod permissions;
pub mod runtime;
pub mod user;

pub use filters::{validate_filters, Filters, Metadata, SortDirection};
pub use movie::{validate_movie, Movie};
pub use permissions::{Permissions, MOVIES_READ, MOVIES_WRITE};
pub use runtime::{InvalidRuntimeFormat, Runtime};
pub use user::{Password, PasswordError, User};
