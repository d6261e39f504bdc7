// SPDX-License-Identifier: Apache-2.0
//! S3 remote backend, built on `object_store::aws::AmazonS3Builder`.

use std::sync::Arc;

use object_store::aws::AmazonS3Builder;
use serde_json::json;

use crate::error::{Error, Result};
use crate::remote::ObjectStoreRemote;

/// Explicit access key / secret pair. When absent, credentials are pulled
/// from the environment (`AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`,
/// `AWS_DEFAULT_REGION`, `AWS_ENDPOINT`), i.e. the default AWS credential
/// chain.
pub struct Creds {
    pub access_key_id: String,
    pub secret_access_key: String,
}

pub struct Params<'a> {
    pub bucket: &'a str,
    pub prefix: &'a str,
    pub region: Option<&'a str>,
    pub creds: Option<&'a Creds>,
    /// Named AWS profile. `object_store` has no direct profile parameter;
    /// this is applied by setting `AWS_PROFILE` for the duration of client
    /// construction.
    pub profile: Option<&'a str>,
}

pub fn new(params: Params) -> Result<ObjectStoreRemote> {
    let _profile_guard = params.profile.map(ProfileGuard::set);

    let mut builder = if params.creds.is_some() {
        AmazonS3Builder::new()
    } else {
        AmazonS3Builder::from_env()
    };
    builder = builder.with_bucket_name(params.bucket);
    if let Some(region) = params.region {
        builder = builder.with_region(region);
    }
    if let Some(creds) = params.creds {
        builder = builder
            .with_access_key_id(&creds.access_key_id)
            .with_secret_access_key(&creds.secret_access_key);
    }

    let store = builder
        .build()
        .map_err(|e| Error::Config(format!("s3 remote config for bucket {}: {}", params.bucket, e)))?;

    Ok(ObjectStoreRemote::new(
        "s3",
        json!({ "bucket": params.bucket, "prefix": params.prefix }),
        params.prefix,
        Arc::new(store),
    ))
}

/// Sets `AWS_PROFILE` and restores its previous value on drop. Construction
/// of the S3 client is synchronous and short-lived, so the brief global
/// mutation is acceptable.
struct ProfileGuard {
    previous: Option<String>,
}

impl ProfileGuard {
    fn set(profile: &str) -> ProfileGuard {
        let previous = std::env::var("AWS_PROFILE").ok();
        std::env::set_var("AWS_PROFILE", profile);
        ProfileGuard { previous }
    }
}

impl Drop for ProfileGuard {
    fn drop(&mut self) {
        match &self.previous {
            Some(v) => std::env::set_var("AWS_PROFILE", v),
            None => std::env::remove_var("AWS_PROFILE"),
        }
    }
}
