//! Durable per-device property storage.

use anyhow::Result;

/// Key/value property storage keyed by device name and attribute name.
///
/// Values are stored as strings; callers parse them. Implementations must be
/// safe to share between device instances.
pub trait PropertyStore: Send + Sync {
    /// Read a property. `Ok(None)` when it was never written.
    fn get(&self, device: &str, attribute: &str) -> Result<Option<String>>;

    /// Write a property, replacing any previous value.
    fn put(&self, device: &str, attribute: &str, value: &str) -> Result<()>;
}
