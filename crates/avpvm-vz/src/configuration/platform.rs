//! Mac platform configuration.
//!
//! Builds `VZMacPlatformConfiguration` from a validated record: a hardware
//! model created from a private descriptor (platform version, board ID and
//! minimum OS), a machine identifier carrying the chip ID, and the auxiliary
//! storage when one is configured.

use avpvm_core::{ConfigurationRecord, OsVersion};
use objc2::runtime::{AnyObject, Bool, Sel};
use std::ffi::c_void;
use std::path::Path;
use std::ptr;

use crate::error::{VzError, VzResult};
use crate::ffi::{extract_nserror, nsurl_file_path, release, require_class, responds_to};
use crate::{msg_send, msg_send_bool, msg_send_id_u64, msg_send_void, msg_send_void_bool, msg_send_void_i64};

/// `_VZMacHardwareModelDescriptor` ISA value for arm64.
const ISA_ARM64: i64 = 2;

/// `NSOperatingSystemVersion`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct NSOperatingSystemVersion {
    major: i64,
    minor: i64,
    patch: i64,
}

impl From<OsVersion> for NSOperatingSystemVersion {
    fn from(v: OsVersion) -> Self {
        Self {
            major: i64::from(v.major),
            minor: i64::from(v.minor),
            patch: i64::from(v.subminor),
        }
    }
}

// ============================================================================
// Mac Platform
// ============================================================================

/// A Mac platform configuration.
pub struct MacPlatform {
    inner: *mut AnyObject,
}

unsafe impl Send for MacPlatform {}

impl MacPlatform {
    /// Creates the platform configuration for `record`.
    pub fn new(record: &ConfigurationRecord) -> VzResult<Self> {
        let identity = record.identity();
        let hardware_model = create_hardware_model(
            record.platform_version().as_u32(),
            identity.board_id(),
            record.minimum_os(),
        )?;

        let result = Self::with_hardware_model(record, hardware_model);
        release(hardware_model);
        result
    }

    fn with_hardware_model(
        record: &ConfigurationRecord,
        hardware_model: *mut AnyObject,
    ) -> VzResult<Self> {
        let machine_identifier = create_machine_identifier(record.identity().chip_id())?;

        unsafe {
            let cls = require_class("VZMacPlatformConfiguration")?;
            let obj = msg_send!(cls, new);
            if obj.is_null() {
                release(machine_identifier);
                return Err(VzError::Creation("VZMacPlatformConfiguration"));
            }
            let platform = Self { inner: obj };

            msg_send_void!(obj, setHardwareModel: hardware_model);
            msg_send_void!(obj, setMachineIdentifier: machine_identifier);
            release(machine_identifier);

            if let Some(aux_path) = record.aux_path() {
                let storage = open_auxiliary_storage(aux_path, hardware_model)?;
                msg_send_void!(obj, setAuxiliaryStorage: storage);
                release(storage);
            }

            Ok(platform)
        }
    }

    /// Enables or disables the production fuse.
    ///
    /// The runtime defaults to production mode; disabling it runs the guest
    /// with CPFM 01.
    pub fn set_production_mode(&mut self, enabled: bool) -> VzResult<()> {
        let sel = objc2::sel!(_setProductionModeEnabled:);
        if !responds_to(self.inner, sel) {
            return Err(VzError::SelectorUnavailable("_setProductionModeEnabled:"));
        }
        unsafe {
            msg_send_void_bool!(self.inner, _setProductionModeEnabled: Bool::new(enabled));
        }
        tracing::debug!(enabled, "production mode set");
        Ok(())
    }

    /// Returns the underlying Objective-C object pointer.
    pub fn as_ptr(&self) -> *mut AnyObject {
        self.inner
    }
}

impl Drop for MacPlatform {
    fn drop(&mut self) {
        if !self.inner.is_null() {
            release(self.inner);
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Creates a retained `VZMacHardwareModel` through `_VZMacHardwareModelDescriptor`.
fn create_hardware_model(
    platform_version: u32,
    board_id: u32,
    minimum_os: OsVersion,
) -> VzResult<*mut AnyObject> {
    unsafe {
        let descriptor_cls = require_class("_VZMacHardwareModelDescriptor")?;
        let descriptor = msg_send!(descriptor_cls, new);
        if descriptor.is_null() {
            return Err(VzError::Creation("_VZMacHardwareModelDescriptor"));
        }

        let set_u32: unsafe extern "C" fn(*mut AnyObject, Sel, u32) =
            std::mem::transmute(crate::ffi::runtime::objc_msgSend as *const c_void);
        set_u32(descriptor, objc2::sel!(setPlatformVersion:), platform_version);
        set_u32(descriptor, objc2::sel!(setBoardID:), board_id);
        msg_send_void_i64!(descriptor, setISA: ISA_ARM64);

        let sel = objc2::sel!(setMinimumSupportedOSVersion:);
        if responds_to(descriptor, sel) {
            let set_version: unsafe extern "C" fn(*mut AnyObject, Sel, NSOperatingSystemVersion) =
                std::mem::transmute(crate::ffi::runtime::objc_msgSend as *const c_void);
            set_version(descriptor, sel, minimum_os.into());
        } else {
            tracing::debug!(%minimum_os, "descriptor has no minimum OS setter, using runtime default");
        }

        let model_cls = require_class("VZMacHardwareModel")?;
        let model = msg_send!(model_cls, _hardwareModelWithDescriptor: descriptor);
        release(descriptor);

        if model.is_null() {
            return Err(VzError::InvalidConfiguration(format!(
                "no hardware model for platform version {platform_version}, board ID {board_id:#x}"
            )));
        }
        let model = crate::ffi::retain(model);

        if !msg_send_bool!(model, isSupported).as_bool() {
            release(model);
            return Err(VzError::InvalidConfiguration(format!(
                "hardware model for platform version {platform_version} is not supported on this host"
            )));
        }

        tracing::debug!(
            platform_version,
            board_id = format_args!("{board_id:#x}"),
            "created hardware model"
        );
        Ok(model)
    }
}

/// Creates a retained `VZMacMachineIdentifier` carrying `chip_id` as its ECID.
fn create_machine_identifier(chip_id: u64) -> VzResult<*mut AnyObject> {
    unsafe {
        let cls = require_class("VZMacMachineIdentifier")?;
        let alloc = msg_send!(cls, alloc);
        let obj = msg_send_id_u64!(alloc, _initWithECID: chip_id);
        if obj.is_null() {
            return Err(VzError::Creation("VZMacMachineIdentifier"));
        }
        Ok(obj)
    }
}

/// Opens the auxiliary storage at `path`, creating it if it does not exist yet.
fn open_auxiliary_storage(path: &Path, hardware_model: *mut AnyObject) -> VzResult<*mut AnyObject> {
    unsafe {
        let cls = require_class("VZMacAuxiliaryStorage")?;
        let url = nsurl_file_path(path);
        let alloc = msg_send!(cls, alloc);

        let storage = if path.exists() {
            tracing::debug!(path = %path.display(), "opening auxiliary storage");
            msg_send!(alloc, initWithContentsOfURL: url)
        } else {
            tracing::info!(path = %path.display(), "creating auxiliary storage");
            let mut error: *mut AnyObject = ptr::null_mut();
            let func: unsafe extern "C" fn(
                *mut AnyObject,
                Sel,
                *mut AnyObject,
                *mut AnyObject,
                u64,
                *mut *mut AnyObject,
            ) -> *mut AnyObject =
                std::mem::transmute(crate::ffi::runtime::objc_msgSend as *const c_void);
            let obj = func(
                alloc,
                objc2::sel!(initCreatingStorageAtURL:hardwareModel:options:error:),
                url,
                hardware_model,
                0,
                &mut error,
            );
            if obj.is_null() {
                release(url);
                return Err(extract_nserror(error));
            }
            obj
        };
        release(url);

        if storage.is_null() {
            return Err(VzError::InvalidConfiguration(format!(
                "cannot open auxiliary storage {}",
                path.display()
            )));
        }
        Ok(storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avpvm_core::VmParameters;

    #[test]
    fn test_os_version_conversion() {
        let v = NSOperatingSystemVersion::from(OsVersion::new(12, 3, 1));
        assert_eq!((v.major, v.minor, v.patch), (12, 3, 1));
    }

    #[test]
    fn test_machine_identifier() {
        if !crate::is_supported() {
            println!("Virtualization not supported, skipping");
            return;
        }
        match create_machine_identifier(0x0011_2233_4455_6677) {
            Ok(id) => release(id),
            Err(e) => println!("private machine identifier unavailable: {e}"),
        }
    }

    #[test]
    fn test_platform_from_record() {
        if !crate::is_supported() {
            println!("Virtualization not supported, skipping");
            return;
        }
        let record = ConfigurationRecord::new(VmParameters::default()).unwrap();
        match MacPlatform::new(&record) {
            Ok(platform) => assert!(!platform.as_ptr().is_null()),
            // Research platforms need the private entitlement and a host
            // that supports the requested hardware model.
            Err(e) => println!("Mac platform unavailable: {e}"),
        }
    }
}
