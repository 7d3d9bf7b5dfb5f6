use crate::{UploadConfig, UploadRequest, ValidationError};

/// Pure pre-flight check of a candidate file's declared type and size
#[derive(Debug, Clone)]
pub struct FileValidator {
    allowed_mime_prefix: String,
    max_file_size_bytes: u64,
}

impl FileValidator {
    pub fn new<S: Into<String>>(allowed_mime_prefix: S, max_file_size_bytes: u64) -> Self {
        Self {
            allowed_mime_prefix: allowed_mime_prefix.into(),
            max_file_size_bytes,
        }
    }

    pub fn from_config(config: &UploadConfig) -> Self {
        Self::new(config.allowed_mime_prefix.clone(), config.max_file_size_bytes)
    }

    /// Type is checked before size, mirroring what a user fixes first.
    pub fn validate(&self, request: &UploadRequest) -> Result<(), ValidationError> {
        let mime = request.mime_type.trim().to_ascii_lowercase();
        if !mime.starts_with(&self.allowed_mime_prefix.to_ascii_lowercase()) {
            return Err(ValidationError::InvalidType {
                mime_type: request.mime_type.clone(),
                expected_prefix: self.allowed_mime_prefix.clone(),
            });
        }

        if request.size_bytes > self.max_file_size_bytes {
            return Err(ValidationError::TooLarge {
                size_bytes: request.size_bytes,
                max_bytes: self.max_file_size_bytes,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn request(mime: &str, size: usize) -> UploadRequest {
        UploadRequest::from_bytes("episode.bin", mime, Bytes::from(vec![0u8; size]))
    }

    #[test]
    fn test_accepts_audio_within_limit() {
        let validator = FileValidator::new("audio/", 1024);
        assert_eq!(validator.validate(&request("audio/mpeg", 1024)), Ok(()));
        assert_eq!(validator.validate(&request("Audio/WAV", 10)), Ok(()));
    }

    #[test]
    fn test_rejects_other_types() {
        let validator = FileValidator::new("audio/", 1024);
        let err = validator.validate(&request("video/mp4", 10)).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::InvalidType { ref mime_type, .. } if mime_type == "video/mp4"
        ));
        assert!(validator.validate(&request("", 10)).is_err());
    }

    #[test]
    fn test_rejects_oversized_files() {
        let validator = FileValidator::new("audio/", 1024);
        assert_eq!(
            validator.validate(&request("audio/mpeg", 1025)),
            Err(ValidationError::TooLarge {
                size_bytes: 1025,
                max_bytes: 1024
            })
        );
    }

    #[test]
    fn test_image_instance() {
        let validator = FileValidator::from_config(
            &UploadConfig::default()
                .with_allowed_mime_prefix("image/")
                .with_max_file_size(4 * 1024 * 1024),
        );
        assert!(validator.validate(&request("image/png", 2048)).is_ok());
        assert!(validator.validate(&request("audio/mpeg", 2048)).is_err());
    }
}
