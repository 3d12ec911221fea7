//! Device authentication and store binding.

pub mod enrollment;
pub mod middleware;

pub use enrollment::{enroll_device, issue_enrollment_code, DeviceMeta};
pub use middleware::{admin_auth, device_auth, device_status, DeviceContext};
