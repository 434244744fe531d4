use crate::pdu::TransmissionMode;
use crate::util::UnsignedByteField;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[error("file path with length {0} exceeds the maximum of 255 bytes")]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FilePathTooLarge(pub usize);

/// Put request which starts a file copy operation on the source entity.
///
/// Optional fields which are not set are determined by the remote entity configuration of the
/// destination entity.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PutRequest<'src_file, 'dest_file> {
    pub destination_id: UnsignedByteField,
    source_file: &'src_file str,
    dest_file: &'dest_file str,
    pub trans_mode: Option<TransmissionMode>,
    pub closure_requested: Option<bool>,
}

pub fn generic_path_checks(source_file: &str, dest_file: &str) -> Result<(), FilePathTooLarge> {
    for path in [source_file, dest_file] {
        if path.len() > u8::MAX as usize {
            return Err(FilePathTooLarge(path.len()));
        }
    }
    Ok(())
}

impl<'src_file, 'dest_file> PutRequest<'src_file, 'dest_file> {
    /// The file paths are encoded as LV values in the Metadata PDU, so they are limited to
    /// 255 bytes.
    pub fn new_regular_request(
        dest_id: UnsignedByteField,
        source_file: &'src_file str,
        dest_file: &'dest_file str,
        trans_mode: Option<TransmissionMode>,
        closure_requested: Option<bool>,
    ) -> Result<Self, FilePathTooLarge> {
        generic_path_checks(source_file, dest_file)?;
        Ok(Self {
            destination_id: dest_id,
            source_file,
            dest_file,
            trans_mode,
            closure_requested,
        })
    }

    pub fn source_file(&self) -> &'src_file str {
        self.source_file
    }

    pub fn dest_file(&self) -> &'dest_file str {
        self.dest_file
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::{UbfU16, UnsignedEnum};

    pub const DEST_ID: UbfU16 = UbfU16::new(5);

    #[test]
    fn test_put_request_basic() {
        let src_file = "/tmp/hello.txt";
        let dest_file = "/tmp/hello2.txt";
        let put_request = PutRequest::new_regular_request(
            DEST_ID.into(),
            src_file,
            dest_file,
            Some(TransmissionMode::Acknowledged),
            None,
        )
        .unwrap();
        assert_eq!(put_request.destination_id.value(), 5);
        assert_eq!(put_request.source_file(), src_file);
        assert_eq!(put_request.dest_file(), dest_file);
        assert_eq!(
            put_request.trans_mode,
            Some(TransmissionMode::Acknowledged)
        );
        assert!(put_request.closure_requested.is_none());
    }

    #[test]
    fn test_put_request_path_checks_source_too_long() {
        let mut invalid_path = String::from("/tmp/");
        invalid_path += "a".repeat(u8::MAX as usize).as_str();
        let error = PutRequest::new_regular_request(
            DEST_ID.into(),
            &invalid_path,
            "/tmp/hello2.txt",
            None,
            None,
        )
        .unwrap_err();
        assert_eq!(u8::MAX as usize + 5, error.0);
    }

    #[test]
    fn test_put_request_path_checks_dest_file_too_long() {
        let mut invalid_path = String::from("/tmp/");
        invalid_path += "a".repeat(u8::MAX as usize).as_str();
        let error = PutRequest::new_regular_request(
            DEST_ID.into(),
            "/tmp/hello2.txt",
            &invalid_path,
            None,
            None,
        )
        .unwrap_err();
        assert_eq!(u8::MAX as usize + 5, error.0);
    }
}
