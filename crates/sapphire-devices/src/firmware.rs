//! Firmware images on disk
//!
//! The build subsystem drops one image per firmware id under the image
//! root; this side only consumes them. An image carries its info block at
//! a fixed offset and a big-endian CRC-16 trailer appended past the last
//! payload byte.

use crate::error::{DeviceError, Result};
use sapphire_net::data::FirmwareInfo;
use sapphire_net::serial::frame_crc;
use std::path::{Path, PathBuf};

/// Byte offset of the info block inside an image
pub const FIRMWARE_INFO_OFFSET: usize = 0x120;

const IMAGE_FILE_NAME: &str = "firmware.bin";

/// Directory of firmware images, one subdirectory per firmware id
#[derive(Clone, Debug)]
pub struct FirmwareStore {
    root: PathBuf,
}

impl FirmwareStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Path of the image for a firmware id, if present
    pub fn image_path(&self, firmware_id: &str) -> Result<PathBuf> {
        let path = self.root.join(firmware_id).join(IMAGE_FILE_NAME);
        if !path.is_file() {
            return Err(DeviceError::FirmwareMissing(firmware_id.to_string()));
        }
        Ok(path)
    }

    /// Read and validate the image for a firmware id
    pub fn load_image(&self, firmware_id: &str) -> Result<FirmwareImage> {
        let data = std::fs::read(self.image_path(firmware_id)?)?;
        FirmwareImage::parse(data)
    }
}

/// A validated firmware image
#[derive(Clone, Debug)]
pub struct FirmwareImage {
    pub info: FirmwareInfo,
    pub data: Vec<u8>,
}

impl FirmwareImage {
    /// Parse the info block and check the CRC trailer
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        if data.len() < FIRMWARE_INFO_OFFSET + FirmwareInfo::SIZE + 2 {
            return Err(DeviceError::FirmwareInvalid(format!(
                "image too small: {} bytes",
                data.len()
            )));
        }

        let mut info_buf = &data[FIRMWARE_INFO_OFFSET..];
        let info = FirmwareInfo::unpack(&mut info_buf)
            .map_err(|e| DeviceError::FirmwareInvalid(e.to_string()))?;

        let body = &data[..data.len() - 2];
        let trailer = u16::from_be_bytes([data[data.len() - 2], data[data.len() - 1]]);
        if frame_crc(body) != trailer {
            return Err(DeviceError::FirmwareInvalid("crc mismatch".to_string()));
        }

        Ok(Self { info, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use uuid::Uuid;

    fn build_image(info: &FirmwareInfo) -> Vec<u8> {
        let mut image = vec![0u8; FIRMWARE_INFO_OFFSET];
        let mut block = BytesMut::new();
        info.pack(&mut block);
        image.extend_from_slice(&block);
        image.extend_from_slice(&[0xab; 64]); // application payload

        let crc = frame_crc(&image);
        image.extend_from_slice(&crc.to_be_bytes());
        image
    }

    fn sample_info() -> FirmwareInfo {
        FirmwareInfo {
            firmware_length: 1024,
            firmware_id: Uuid::new_v4(),
            os_name: "sapphire os".into(),
            os_version: "1.0".into(),
            app_name: "blinky".into(),
            app_version: "2.1".into(),
        }
    }

    #[test]
    fn test_parse_valid_image() {
        let info = sample_info();
        let image = FirmwareImage::parse(build_image(&info)).unwrap();
        assert_eq!(image.info, info);
    }

    #[test]
    fn test_corrupt_crc_rejected() {
        let mut data = build_image(&sample_info());
        let last = data.len() - 1;
        data[last] ^= 0xff;

        assert!(matches!(
            FirmwareImage::parse(data),
            Err(DeviceError::FirmwareInvalid(_))
        ));
    }

    #[test]
    fn test_short_image_rejected() {
        assert!(matches!(
            FirmwareImage::parse(vec![0; 16]),
            Err(DeviceError::FirmwareInvalid(_))
        ));
    }

    #[test]
    fn test_store_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let store = FirmwareStore::new(dir.path());
        let fwid = Uuid::new_v4().to_string();

        assert!(matches!(
            store.image_path(&fwid),
            Err(DeviceError::FirmwareMissing(_))
        ));

        let image_dir = dir.path().join(&fwid);
        std::fs::create_dir_all(&image_dir).unwrap();
        std::fs::write(image_dir.join("firmware.bin"), build_image(&sample_info())).unwrap();

        assert!(store.image_path(&fwid).is_ok());
        assert!(store.load_image(&fwid).is_ok());
    }
}
