//! Owned license payload buffer.

/// License request or response bytes.
///
/// The buffer is owned and never shared: it is intentionally not `Clone`,
/// ownership moves with the value.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DrmData {
    data: Vec<u8>,
}

impl DrmData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy `data` into a new buffer.
    pub fn from_slice(data: &[u8]) -> Self {
        Self {
            data: data.to_vec(),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Replace the contents.
    pub fn set_data(&mut self, data: &[u8]) {
        self.data.clear();
        self.data.extend_from_slice(data);
    }

    /// Append to the contents.
    pub fn add_data(&mut self, data: &[u8]) {
        self.data.extend_from_slice(data);
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

impl From<Vec<u8>> for DrmData {
    fn from(data: Vec<u8>) -> Self {
        Self { data }
    }
}

#[cfg(test)]
mod tests {
    use super::DrmData;

    #[test]
    fn from_slice_keeps_bytes() {
        for len in [0usize, 1, 37] {
            let bytes: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let data = DrmData::from_slice(&bytes);
            assert_eq!(data.data(), bytes.as_slice());
            assert_eq!(data.len(), len);
        }
    }

    #[test]
    fn add_data_is_cumulative() {
        let mut data = DrmData::new();
        data.add_data(b"ab");
        data.add_data(b"cd");
        assert_eq!(data.data(), b"abcd");
    }

    #[test]
    fn set_data_replaces() {
        let mut data = DrmData::from_slice(b"challenge");
        data.set_data(b"key");
        assert_eq!(data.into_vec(), b"key".to_vec());
    }
}
