use super::{
    add_pdu_crc, check_target_buf_len, parse_directive_header, read_fss_field, write_fss_field,
    CfdpPdu, ChecksumType, CrcFlag, Direction, FileDirectiveType, PduError, PduHeader, PduType,
    WritablePduPacket,
};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Maximum length of a file name inside a length-value field.
pub const MAX_FILE_NAME_LEN: usize = u8::MAX as usize;

/// Generic parameters of the Metadata PDU which do not depend on the file names.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MetadataGenericParams {
    pub closure_requested: bool,
    pub checksum_type: ChecksumType,
    pub file_size: u64,
}

impl MetadataGenericParams {
    pub fn new(closure_requested: bool, checksum_type: ChecksumType, file_size: u64) -> Self {
        Self {
            closure_requested,
            checksum_type,
            file_size,
        }
    }
}

/// Metadata PDU abstraction.
///
/// For more information, refer to CFDP chapter 5.2.5. Options TLVs are not supported and are
/// skipped when parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MetadataPdu {
    pdu_header: PduHeader,
    metadata_params: MetadataGenericParams,
    src_file_name: String,
    dest_file_name: String,
}

impl MetadataPdu {
    pub fn new(
        mut pdu_header: PduHeader,
        metadata_params: MetadataGenericParams,
        src_file_name: impl Into<String>,
        dest_file_name: impl Into<String>,
    ) -> Result<Self, PduError> {
        let src_file_name = src_file_name.into();
        let dest_file_name = dest_file_name.into();
        for name in [&src_file_name, &dest_file_name] {
            if name.len() > MAX_FILE_NAME_LEN {
                return Err(PduError::FileNameTooLarge(name.len()));
            }
        }
        pdu_header.pdu_conf.direction = Direction::TowardsReceiver;
        pdu_header.pdu_type = PduType::FileDirective;
        let mut metadata_pdu = Self {
            pdu_header,
            metadata_params,
            src_file_name,
            dest_file_name,
        };
        let content_len = metadata_pdu.calc_content_len();
        metadata_pdu
            .pdu_header
            .set_datafield_len_for_content(content_len);
        Ok(metadata_pdu)
    }

    pub fn metadata_params(&self) -> &MetadataGenericParams {
        &self.metadata_params
    }

    pub fn src_file_name(&self) -> &str {
        &self.src_file_name
    }

    pub fn dest_file_name(&self) -> &str {
        &self.dest_file_name
    }

    fn calc_content_len(&self) -> usize {
        // Directive code and the closure/checksum byte.
        2 + self.pdu_header.pdu_conf.file_flag.fss_width()
            + 1
            + self.src_file_name.len()
            + 1
            + self.dest_file_name.len()
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, PduError> {
        let (pdu_header, mut current_idx, full_len_without_crc) =
            parse_directive_header(buf, FileDirectiveType::MetadataPdu)?;
        let file_flag = pdu_header.pdu_conf.file_flag;
        if current_idx + 1 + file_flag.fss_width() > full_len_without_crc {
            return Err(PduError::MalformedPdu("Metadata PDU too short"));
        }
        let closure_requested = ((buf[current_idx] >> 6) & 0b1) != 0;
        let checksum_raw = buf[current_idx] & 0b1111;
        let checksum_type = ChecksumType::try_from(checksum_raw)
            .map_err(|_| PduError::InvalidChecksumType(checksum_raw))?;
        current_idx += 1;
        let (fss_len, file_size) = read_fss_field(file_flag, &buf[current_idx..]);
        current_idx += fss_len;
        let src_file_name = read_lv_string(buf, &mut current_idx, full_len_without_crc)?;
        let dest_file_name = read_lv_string(buf, &mut current_idx, full_len_without_crc)?;
        Ok(Self {
            pdu_header,
            metadata_params: MetadataGenericParams::new(
                closure_requested,
                checksum_type,
                file_size,
            ),
            src_file_name,
            dest_file_name,
        })
    }
}

fn read_lv_string(buf: &[u8], current_idx: &mut usize, end: usize) -> Result<String, PduError> {
    if *current_idx >= end {
        return Err(PduError::MalformedPdu("missing length-value field"));
    }
    let len = buf[*current_idx] as usize;
    *current_idx += 1;
    if *current_idx + len > end {
        return Err(PduError::MalformedPdu("length-value field exceeds PDU"));
    }
    let value = core::str::from_utf8(&buf[*current_idx..*current_idx + len])
        .map_err(|_| PduError::MalformedPdu("file name is not valid UTF-8"))?;
    *current_idx += len;
    Ok(value.to_string())
}

fn write_lv_str(buf: &mut [u8], value: &str) -> usize {
    buf[0] = value.len() as u8;
    buf[1..1 + value.len()].copy_from_slice(value.as_bytes());
    1 + value.len()
}

impl CfdpPdu for MetadataPdu {
    fn pdu_header(&self) -> &PduHeader {
        &self.pdu_header
    }

    fn file_directive_type(&self) -> Option<FileDirectiveType> {
        Some(FileDirectiveType::MetadataPdu)
    }
}

impl WritablePduPacket for MetadataPdu {
    fn len_written(&self) -> usize {
        self.pdu_header.pdu_len()
    }

    fn write_to_bytes(&self, buf: &mut [u8]) -> Result<usize, PduError> {
        check_target_buf_len(buf, self.len_written())?;
        let mut current_idx = self.pdu_header.write_to_bytes(buf)?;
        buf[current_idx] = FileDirectiveType::MetadataPdu as u8;
        current_idx += 1;
        buf[current_idx] = ((self.metadata_params.closure_requested as u8) << 6)
            | (self.metadata_params.checksum_type as u8);
        current_idx += 1;
        current_idx += write_fss_field(
            self.pdu_header.pdu_conf.file_flag,
            self.metadata_params.file_size,
            &mut buf[current_idx..],
        )?;
        current_idx += write_lv_str(&mut buf[current_idx..], &self.src_file_name);
        current_idx += write_lv_str(&mut buf[current_idx..], &self.dest_file_name);
        if self.pdu_header.pdu_conf.crc_flag == CrcFlag::WithCrc {
            current_idx = add_pdu_crc(buf, current_idx);
        }
        Ok(current_idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::tests::common_pdu_conf;
    use crate::pdu::{decode, LargeFileFlag, Pdu};

    const SRC_FILENAME: &str = "hello-src.txt";
    const DEST_FILENAME: &str = "hello-dest.txt";

    fn generic_metadata_pdu(crc_flag: CrcFlag, fss: LargeFileFlag) -> MetadataPdu {
        let pdu_header = PduHeader::new_for_file_directive(common_pdu_conf(crc_flag, fss), 0);
        MetadataPdu::new(
            pdu_header,
            MetadataGenericParams::new(true, ChecksumType::Crc32, 0x1010),
            SRC_FILENAME,
            DEST_FILENAME,
        )
        .expect("creating metadata PDU failed")
    }

    #[test]
    fn test_basic() {
        let metadata_pdu = generic_metadata_pdu(CrcFlag::NoCrc, LargeFileFlag::Normal);
        assert_eq!(metadata_pdu.src_file_name(), SRC_FILENAME);
        assert_eq!(metadata_pdu.dest_file_name(), DEST_FILENAME);
        assert!(metadata_pdu.metadata_params().closure_requested);
        assert_eq!(
            metadata_pdu.len_written(),
            7 + 2 + 4 + 1 + SRC_FILENAME.len() + 1 + DEST_FILENAME.len()
        );
    }

    #[test]
    fn test_serialization_layout() {
        let metadata_pdu = generic_metadata_pdu(CrcFlag::NoCrc, LargeFileFlag::Normal);
        let buf = metadata_pdu.to_vec().unwrap();
        assert_eq!(buf[7], FileDirectiveType::MetadataPdu as u8);
        assert_eq!(buf[8], (1 << 6) | ChecksumType::Crc32 as u8);
        assert_eq!(&buf[9..13], &[0, 0, 0x10, 0x10]);
        assert_eq!(buf[13] as usize, SRC_FILENAME.len());
        assert_eq!(&buf[14..14 + SRC_FILENAME.len()], SRC_FILENAME.as_bytes());
        assert_eq!(MetadataPdu::from_bytes(&buf).unwrap(), metadata_pdu);
    }

    #[test]
    fn test_large_file_with_crc() {
        let metadata_pdu = generic_metadata_pdu(CrcFlag::WithCrc, LargeFileFlag::Large);
        let buf = metadata_pdu.to_vec().unwrap();
        match decode(&buf).unwrap() {
            Pdu::Metadata(read_back) => assert_eq!(read_back, metadata_pdu),
            other => panic!("unexpected PDU {other:?}"),
        }
    }

    #[test]
    fn test_file_name_too_large() {
        let pdu_header = PduHeader::new_for_file_directive(
            common_pdu_conf(CrcFlag::NoCrc, LargeFileFlag::Normal),
            0,
        );
        let long_name = "a".repeat(256);
        let error = MetadataPdu::new(
            pdu_header,
            MetadataGenericParams::new(false, ChecksumType::Modular, 0),
            long_name,
            DEST_FILENAME,
        )
        .unwrap_err();
        assert_eq!(error, PduError::FileNameTooLarge(256));
    }

    #[test]
    fn test_invalid_checksum_type() {
        let metadata_pdu = generic_metadata_pdu(CrcFlag::NoCrc, LargeFileFlag::Normal);
        let mut buf = metadata_pdu.to_vec().unwrap();
        buf[8] = (buf[8] & 0xF0) | 7;
        assert_eq!(
            MetadataPdu::from_bytes(&buf).unwrap_err(),
            PduError::InvalidChecksumType(7)
        );
    }

    #[test]
    fn test_lv_field_exceeds_pdu() {
        let metadata_pdu = generic_metadata_pdu(CrcFlag::NoCrc, LargeFileFlag::Normal);
        let mut buf = metadata_pdu.to_vec().unwrap();
        buf[13] = 200;
        assert!(matches!(
            MetadataPdu::from_bytes(&buf).unwrap_err(),
            PduError::MalformedPdu(_)
        ));
    }
}
