//! Query subsystem (§4.4, §4.5): live, observer-driven result sets over a
//! [`crate::store::Store`] that never themselves own record data.

pub mod local;
pub mod windowed;

pub use local::LocalQuery;
pub use windowed::WindowedQuery;
