//! Victim side of the handoff protocol for native Rust victims.
//!
//! A victim links this crate, publishes the address of its target array with
//! [`export_addresses`] and then calls the marker routines at the agreed
//! points. The markers are unmangled and never inlined so an instrumentation
//! engine finds them by name.

use crate::handoff::HandoffRecord;
use std::hint::black_box;
use std::io::Write;
use std::path::Path;

/// Trigger marker: the handoff file has been written
#[no_mangle]
#[inline(never)]
pub extern "C" fn addr_label() {
    black_box(());
}

/// Sync marker: the trial is over, restore and advance
#[no_mangle]
#[inline(never)]
pub extern "C" fn sync_marker() {
    black_box(());
}

#[no_mangle]
#[inline(never)]
pub extern "C" fn start_measurement() {
    black_box(());
}

#[no_mangle]
#[inline(never)]
pub extern "C" fn end_measurement() {
    black_box(());
}

/// Write the handoff record to `path`.
///
/// The content is written to a sibling file first and renamed into place, so
/// a concurrent reader never observes a partially written record.
pub fn export_addresses(path: &Path, record: &HandoffRecord) -> std::io::Result<()> {
    let mut staging = path.as_os_str().to_owned();
    staging.push(".tmp");
    {
        let mut file = std::fs::File::create(&staging)?;
        file.write_all(record.to_string().as_bytes())?;
        file.sync_all()?;
    }
    std::fs::rename(&staging, path)
}

/// Publish the address of `words` (and optionally its owning object) and hit
/// the trigger marker.
pub fn publish<T>(path: &Path, object: Option<&T>, words: &[u64]) -> std::io::Result<()> {
    let record = HandoffRecord {
        object_address: object.map(|object| object as *const T as u64),
        base_address: words.as_ptr() as u64,
    };
    export_addresses(path, &record)?;
    addr_label();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handoff::HandoffChannel;

    #[test]
    fn published_addresses_are_readable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("target_address.txt");
        let words = vec![1u64, 2, 3, 4];
        let owner = 7u32;

        publish(&path, Some(&owner), &words).unwrap();

        let record = HandoffChannel::new(&path).read().unwrap();
        assert_eq!(record.base_address, words.as_ptr() as u64);
        assert_eq!(record.object_address, Some(&owner as *const u32 as u64));
        assert_eq!(
            record.target_address(2),
            Some(&words[2] as *const u64 as u64)
        );
        assert!(!dir.path().join("target_address.txt.tmp").exists());
    }
}
