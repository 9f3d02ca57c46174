/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! [`ObjectStore`] on top of the AWS SDK S3 client

use std::{fmt, ops::RangeInclusive};

use async_trait::async_trait;
use aws_sdk_s3::{
    primitives::ByteStream,
    types::{CompletedMultipartUpload, CompletedPart as SdkCompletedPart},
};
use aws_smithy_runtime_api::client::{orchestrator::HttpResponse, result::SdkError};
use bytes::Bytes;

use crate::{
    error::{self, TransferError},
    header::Range,
    object_meta::ObjectMeta,
    store::{CompletedPart, ObjectStore},
};

// Throttling and server errors are worth another attempt, anything else the
// service rejected is not.
fn classify<E>(context: impl fmt::Display, err: SdkError<E, HttpResponse>) -> TransferError
where
    E: std::error::Error + Send + Sync + 'static,
{
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            error::transient(err)
        }
        SdkError::ServiceError(service) => {
            let status = service.raw().status().as_u16();
            if status >= 500 || status == 429 {
                error::transient(err)
            } else {
                error::fatal(context, err)
            }
        }
        _ => error::fatal(context, err),
    }
}

fn part_number(part_number: u64) -> Result<i32, TransferError> {
    i32::try_from(part_number)
        .map_err(|_| error::invalid_meta_request(format!("part number {} out of range", part_number)))
}

#[async_trait]
impl ObjectStore for aws_sdk_s3::Client {
    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMeta, TransferError> {
        let output = self
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(format!("head object {}/{} failed", bucket, key), e))?;
        Ok(output.into())
    }

    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<RangeInclusive<u64>>,
    ) -> Result<Bytes, TransferError> {
        let output = self
            .get_object()
            .bucket(bucket)
            .key(key)
            .set_range(range.map(|r| Range::from(r).into()))
            .send()
            .await
            .map_err(|e| classify(format!("get object {}/{} failed", bucket, key), e))?;

        // a body cut short is a network condition
        let data = output.body.collect().await.map_err(error::transient)?;
        Ok(data.into_bytes())
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
    ) -> Result<Option<String>, TransferError> {
        let output = self
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| classify(format!("put object {}/{} failed", bucket, key), e))?;
        Ok(output.e_tag)
    }

    async fn create_multipart_upload(&self, bucket: &str, key: &str) -> Result<String, TransferError> {
        let output = self
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                classify(format!("create multipart upload {}/{} failed", bucket, key), e)
            })?;
        output.upload_id.ok_or_else(|| {
            error::fatal(
                format!("create multipart upload {}/{} failed", bucket, key),
                "response is missing an upload id",
            )
        })
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u64,
        body: Bytes,
    ) -> Result<String, TransferError> {
        let output = self
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(self::part_number(part_number)?)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| classify(format!("upload part {} of {}/{} failed", part_number, bucket, key), e))?;
        output.e_tag.ok_or_else(|| {
            error::fatal(
                format!("upload part {} of {}/{} failed", part_number, bucket, key),
                "response is missing an entity tag",
            )
        })
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<Option<String>, TransferError> {
        let parts = parts
            .into_iter()
            .map(|part| {
                Ok(SdkCompletedPart::builder()
                    .part_number(part_number(part.part_number)?)
                    .e_tag(part.e_tag)
                    .build())
            })
            .collect::<Result<Vec<_>, TransferError>>()?;

        let output = self
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| {
                classify(format!("complete multipart upload {}/{} failed", bucket, key), e)
            })?;
        Ok(output.e_tag)
    }

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), TransferError> {
        self.abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| {
                classify(format!("abort multipart upload {}/{} failed", bucket, key), e)
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use aws_sdk_s3::operation::head_object::HeadObjectError;
    use aws_smithy_runtime_api::{
        client::{orchestrator::HttpResponse, result::SdkError},
        http::StatusCode,
    };
    use aws_smithy_types::body::SdkBody;

    use super::classify;

    fn service_error(status: u16) -> SdkError<HeadObjectError, HttpResponse> {
        let raw = HttpResponse::new(StatusCode::try_from(status).unwrap(), SdkBody::empty());
        SdkError::service_error(HeadObjectError::unhandled("service error"), raw)
    }

    #[test]
    fn test_service_errors_classified_by_status() {
        assert!(classify("head", service_error(503)).is_transient());
        assert!(classify("head", service_error(500)).is_transient());
        assert!(classify("head", service_error(429)).is_transient());

        let err = classify("head object b/k failed", service_error(403));
        assert!(err.is_fatal());
        assert_eq!("head object b/k failed", err.to_string());
        assert!(classify("head", service_error(404)).is_fatal());
    }

    #[test]
    fn test_timeouts_are_transient() {
        let err: SdkError<HeadObjectError, HttpResponse> = SdkError::timeout_error("read timed out");
        assert!(classify("head", err).is_transient());
    }
}
