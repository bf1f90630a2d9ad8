use std::io::Cursor;

use chrono::{NaiveDate, NaiveDateTime};
use exif::{In, Tag, Value};
use tokio::io::AsyncReadExt;

use crate::core::{ByteSource, FileHandle};

/// EXIF 只读取文件头部
pub const CAPTURE_HEADER_LIMIT: usize = 256 * 1024;

/// 从文件头部解析拍摄时间
pub trait CaptureTimeExtractor: Send + Sync {
    /// 返回相机本地时间，无法解析时返回 None
    fn capture_time(&self, header: &[u8]) -> Option<NaiveDateTime>;
}

/// 依次读取 DateTimeOriginal、DateTimeDigitized
#[derive(Debug, Clone, Copy, Default)]
pub struct ExifCaptureExtractor;

impl ExifCaptureExtractor {
    const TAGS: [Tag; 2] = [Tag::DateTimeOriginal, Tag::DateTimeDigitized];
}

impl CaptureTimeExtractor for ExifCaptureExtractor {
    fn capture_time(&self, header: &[u8]) -> Option<NaiveDateTime> {
        let exif = exif::Reader::new().read_from_container(&mut Cursor::new(header)).ok()?;

        Self::TAGS.iter().find_map(|tag| {
            let field = exif.get_field(*tag, In::PRIMARY)?;
            let Value::Ascii(ref parts) = field.value else {
                return None;
            };
            let stamp = exif::DateTime::from_ascii(parts.first()?).ok()?;
            NaiveDate::from_ymd_opt(stamp.year.into(), stamp.month.into(), stamp.day.into())?.and_hms_opt(
                stamp.hour.into(),
                stamp.minute.into(),
                stamp.second.into(),
            )
        })
    }
}

/// 读取文件头部，最多 [`CAPTURE_HEADER_LIMIT`] 字节
pub(crate) async fn read_header(file: &FileHandle) -> std::io::Result<Vec<u8>> {
    match &file.source {
        ByteSource::Memory(data) => Ok(data[..data.len().min(CAPTURE_HEADER_LIMIT)].to_vec()),
        ByteSource::Path(path) => {
            let file = tokio::fs::File::open(path).await?;
            let mut header = Vec::with_capacity(CAPTURE_HEADER_LIMIT.min(64 * 1024));
            file.take(CAPTURE_HEADER_LIMIT as u64).read_to_end(&mut header).await?;
            Ok(header)
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// 只含一个 DateTimeOriginal 字段的最小 JPEG
    pub(crate) fn jpeg_with_capture_time(stamp: &[u8; 19]) -> Vec<u8> {
        let mut tiff = Vec::new();
        tiff.extend_from_slice(b"II\x2a\x00");
        tiff.extend_from_slice(&8u32.to_le_bytes());
        // IFD0: Exif 子目录指针
        tiff.extend_from_slice(&1u16.to_le_bytes());
        tiff.extend_from_slice(&0x8769u16.to_le_bytes());
        tiff.extend_from_slice(&4u16.to_le_bytes());
        tiff.extend_from_slice(&1u32.to_le_bytes());
        tiff.extend_from_slice(&26u32.to_le_bytes());
        tiff.extend_from_slice(&0u32.to_le_bytes());
        // Exif IFD: DateTimeOriginal
        tiff.extend_from_slice(&1u16.to_le_bytes());
        tiff.extend_from_slice(&0x9003u16.to_le_bytes());
        tiff.extend_from_slice(&2u16.to_le_bytes());
        tiff.extend_from_slice(&20u32.to_le_bytes());
        tiff.extend_from_slice(&44u32.to_le_bytes());
        tiff.extend_from_slice(&0u32.to_le_bytes());
        tiff.extend_from_slice(stamp);
        tiff.push(0);

        let mut jpeg = vec![0xFF, 0xD8, 0xFF, 0xE1];
        jpeg.extend_from_slice(&((tiff.len() + 8) as u16).to_be_bytes());
        jpeg.extend_from_slice(b"Exif\0\0");
        jpeg.extend_from_slice(&tiff);
        jpeg.extend_from_slice(&[0xFF, 0xD9]);
        jpeg
    }

    #[test]
    fn test_reads_date_time_original() {
        let jpeg = jpeg_with_capture_time(b"2021:06:15 14:30:00");
        let time = ExifCaptureExtractor.capture_time(&jpeg).unwrap();
        assert_eq!(
            time,
            NaiveDate::from_ymd_opt(2021, 6, 15).unwrap().and_hms_opt(14, 30, 0).unwrap()
        );
    }

    #[test]
    fn test_missing_or_broken_metadata() {
        assert!(ExifCaptureExtractor.capture_time(b"not an image").is_none());
        assert!(ExifCaptureExtractor.capture_time(&[0xFF, 0xD8, 0xFF, 0xD9]).is_none());

        let broken = jpeg_with_capture_time(b"2021:13:45 99:99:99");
        assert!(ExifCaptureExtractor.capture_time(&broken).is_none());
    }
}
