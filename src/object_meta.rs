use aws_sdk_s3::operation::head_object::HeadObjectOutput;

use crate::error::{self, TransferError};

/// Object metadata other than the body, as reported by `HeadObject`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectMeta {
    pub content_length: Option<i64>,
    // set when the metadata came from a ranged response ("bytes 0-99/1234")
    pub content_range: Option<String>,
    pub e_tag: Option<String>,
    pub content_type: Option<String>,
    pub version_id: Option<String>,
    pub last_modified: Option<aws_smithy_types::DateTime>,
}

impl ObjectMeta {
    /// Size of the whole object
    pub fn total_size(&self) -> Result<u64, TransferError> {
        match (self.content_length, self.content_range.as_deref()) {
            (_, Some(range)) => range
                .split_once('/')
                .and_then(|(_, total)| total.parse().ok())
                .ok_or_else(|| {
                    error::invalid_meta_request(format!("invalid content range {}", range))
                }),
            (Some(length), None) => u64::try_from(length).map_err(|_| {
                error::invalid_meta_request(format!("invalid content length {}", length))
            }),
            (None, None) => Err(error::invalid_meta_request(
                "object size cannot be calculated without either content length or content range",
            )),
        }
    }
}

impl From<HeadObjectOutput> for ObjectMeta {
    fn from(value: HeadObjectOutput) -> Self {
        Self {
            content_length: value.content_length,
            content_range: None,
            e_tag: value.e_tag,
            content_type: value.content_type,
            version_id: value.version_id,
            last_modified: value.last_modified,
        }
    }
}
