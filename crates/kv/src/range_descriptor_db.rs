use ranger_kvpb::{Key, KvError, KvResult, RangeDescriptor};

/// Resolves keys to range descriptors.
pub trait RangeDescriptorDb: Send + Sync {
    /// Descriptor of the range containing [`ranger_kvpb::keys::KEY_MIN`].
    ///
    /// # Errors
    ///
    /// Fails if the first range cannot be located.
    fn first_range(&self) -> KvResult<RangeDescriptor>;

    /// Descriptor of the range containing `key`.
    ///
    /// # Errors
    ///
    /// Fails if no known range contains `key`.
    fn range_lookup(&self, key: &Key) -> KvResult<RangeDescriptor> {
        let desc = self.first_range()?;
        if desc.contains_key(key) {
            Ok(desc)
        } else {
            Err(KvError::RangeKeyMismatch {
                key: key.clone(),
                range_id: desc.range_id,
            })
        }
    }
}
