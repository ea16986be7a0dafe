//! Database entities

pub mod device;
pub mod device_archive;

pub use device::Entity as Device;
pub use device_archive::Entity as DeviceArchive;

pub mod prelude {
    pub use super::device::Entity as Device;
    pub use super::device_archive::Entity as DeviceArchive;
}
