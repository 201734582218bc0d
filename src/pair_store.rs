// Jackson Coxson
//
// Pair-record store (component H): persists pair records to disk by serial number, independent
// of usbmuxd's own cache. Callers that talk to a device directly over TCP (no usbmuxd in the
// loop) still need somewhere durable to keep the host identity a device has trusted, so this
// mirrors the directory libimobiledevice itself uses on each platform.

use std::path::{Path, PathBuf};

use crate::{pairing_file::PairingFile, IdeviceError};

/// A directory of pair records, one binary-plist file per device serial number.
///
/// Writes are atomic: the new record is written to a sibling temp file and renamed over the
/// final path, so a reader never observes a partially written record and a crash mid-write never
/// corrupts the previous one.
#[derive(Debug, Clone)]
pub struct PairRecordStore {
    dir: PathBuf,
}

impl PairRecordStore {
    /// Opens a store rooted at `dir`, creating the directory if it doesn't exist.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, IdeviceError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// The platform-conventional pair record directory: `/var/db/lockdown` on macOS,
    /// `/var/lib/lockdown` on Linux, `%ProgramData%\Apple\Lockdown` on Windows.
    pub fn default_dir() -> PathBuf {
        #[cfg(target_os = "macos")]
        {
            PathBuf::from("/var/db/lockdown")
        }
        #[cfg(target_os = "linux")]
        {
            PathBuf::from("/var/lib/lockdown")
        }
        #[cfg(target_os = "windows")]
        {
            PathBuf::from(
                std::env::var("ALLUSERSPROFILE").unwrap_or_else(|_| "C:\\ProgramData".to_string()),
            )
            .join("Apple")
            .join("Lockdown")
        }
        #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
        {
            PathBuf::from("/var/lib/lockdown")
        }
    }

    fn path_for(&self, serial: &str) -> PathBuf {
        self.dir.join(format!("{serial}.plist"))
    }

    /// Reads the pair record for `serial`, if one is stored.
    pub fn load(&self, serial: &str) -> Result<Option<PairingFile>, IdeviceError> {
        let path = self.path_for(serial);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(PairingFile::from_bytes(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Persists `record` for `serial`, replacing any existing record atomically.
    pub fn save(&self, serial: &str, record: PairingFile) -> Result<(), IdeviceError> {
        let final_path = self.path_for(serial);
        let tmp_path = self.dir.join(format!(".{serial}.plist.tmp"));

        let bytes = record.serialize()?;
        std::fs::write(&tmp_path, &bytes)?;
        std::fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }

    /// Deletes the pair record for `serial`, succeeding even if none was stored.
    pub fn delete(&self, serial: &str) -> Result<(), IdeviceError> {
        match std::fs::remove_file(self.path_for(serial)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns whether a record exists for `serial` without parsing it.
    pub fn contains(&self, serial: &str) -> bool {
        self.path_for(serial).exists()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> PairingFile {
        let identity = crate::ca::generate_certificates().unwrap();
        PairingFile {
            device_certificate: identity.device_certificate,
            host_private_key: identity.host_private_key,
            host_certificate: identity.host_certificate,
            root_private_key: identity.root_private_key,
            root_certificate: identity.root_certificate,
            system_buid: "00001111-2222333344445555".to_string(),
            host_id: "AAAA-BBBB-CCCC".to_string(),
            escrow_bag: vec![9, 9, 9],
            wifi_mac_address: "aa:bb:cc:dd:ee:ff".to_string(),
            udid: Some("fedcba9876543210".to_string()),
        }
    }

    #[test]
    fn round_trips_through_save_and_load() {
        let tmp = std::env::temp_dir().join(format!("idevice-pair-store-test-{}", std::process::id()));
        let store = PairRecordStore::open(&tmp).unwrap();

        assert!(store.load("deadbeef").unwrap().is_none());

        store.save("deadbeef", sample_record()).unwrap();
        let loaded = store.load("deadbeef").unwrap().unwrap();
        assert_eq!(loaded.host_id, "AAAA-BBBB-CCCC");
        assert!(store.contains("deadbeef"));

        store.delete("deadbeef").unwrap();
        assert!(store.load("deadbeef").unwrap().is_none());

        std::fs::remove_dir_all(&tmp).ok();
    }
}
