//! macOS boot loader configuration.

use objc2::runtime::AnyObject;
use std::path::{Path, PathBuf};

use crate::error::{VzError, VzResult};
use crate::ffi::{nsurl_file_path, nsurl_to_path, release, require_class, responds_to};
use crate::{msg_send, msg_send_void};

/// A boot loader for Mac guests.
///
/// By default the framework boots its built-in AVPBooter ROM. A custom ROM
/// can be supplied through the private `_setROMURL:`.
pub struct MacOsBootLoader {
    inner: *mut AnyObject,
}

unsafe impl Send for MacOsBootLoader {}

impl MacOsBootLoader {
    /// Creates a new macOS boot loader.
    pub fn new() -> VzResult<Self> {
        unsafe {
            let cls = require_class("VZMacOSBootLoader")?;
            let obj = msg_send!(cls, new);
            if obj.is_null() {
                return Err(VzError::Creation("VZMacOSBootLoader"));
            }
            Ok(Self { inner: obj })
        }
    }

    /// Replaces the built-in boot ROM with the image at `path`.
    pub fn set_rom(&mut self, path: impl AsRef<Path>) -> VzResult<()> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(VzError::NotFound(path.display().to_string()));
        }
        if !responds_to(self.inner, objc2::sel!(_setROMURL:)) {
            return Err(VzError::SelectorUnavailable("_setROMURL:"));
        }

        unsafe {
            let url = nsurl_file_path(path);
            msg_send_void!(self.inner, _setROMURL: url);
            release(url);
        }

        // Read back, so the log shows what the framework will actually boot.
        match self.rom() {
            Some(rom) => tracing::info!(rom = %rom.display(), "boot ROM override set"),
            None => tracing::warn!(path = %path.display(), "boot ROM override not reflected"),
        }
        Ok(())
    }

    /// Returns the boot ROM override, if any.
    pub fn rom(&self) -> Option<PathBuf> {
        if !responds_to(self.inner, objc2::sel!(_romURL)) {
            return None;
        }
        unsafe { nsurl_to_path(msg_send!(self.inner, _romURL)) }
    }

    /// Returns the underlying Objective-C object pointer.
    pub fn as_ptr(&self) -> *mut AnyObject {
        self.inner
    }
}

impl Drop for MacOsBootLoader {
    fn drop(&mut self) {
        if !self.inner.is_null() {
            release(self.inner);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_rom_rejected() {
        if !crate::is_supported() {
            println!("Virtualization not supported, skipping");
            return;
        }
        let mut loader = MacOsBootLoader::new().unwrap();
        let err = loader.set_rom("/nonexistent/AVPBooter.bin").unwrap_err();
        assert!(matches!(err, VzError::NotFound(_)));
    }

    #[test]
    fn test_rom_round_trip() {
        if !crate::is_supported() {
            println!("Virtualization not supported, skipping");
            return;
        }
        let rom = tempfile::NamedTempFile::new().unwrap();
        let mut loader = MacOsBootLoader::new().unwrap();
        match loader.set_rom(rom.path()) {
            Ok(()) => {
                let back = loader.rom().unwrap();
                assert_eq!(back.file_name(), rom.path().file_name());
            }
            Err(VzError::SelectorUnavailable(_)) => println!("_setROMURL: unavailable, skipping"),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
}
