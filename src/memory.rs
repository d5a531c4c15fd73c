//! Secure buffer transport hooks.

/// Strategy wrapping payloads before and after native decryption.
///
/// Platforms that decrypt into secure memory encode the clear buffer into a
/// transport form (possibly relocated or resized) before the CDM call and
/// decode the result back into the caller's buffer afterwards.
pub trait MemorySystem: Send {
    /// Encode `data` for the CDM, `None` on failure.
    fn encode(&mut self, data: &[u8]) -> Option<Vec<u8>>;

    /// Decode `data` back into `out`, `false` on failure.
    fn decode(&mut self, data: &[u8], out: &mut [u8]) -> bool;

    /// Release resources after a failed native decrypt.
    fn terminate_early(&mut self);
}
