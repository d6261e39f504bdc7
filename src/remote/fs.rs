// SPDX-License-Identifier: Apache-2.0
//! Local-directory remote backend: an `object_store::local::LocalFileSystem`
//! rooted at a configured absolute path.

use std::sync::Arc;

use object_store::local::LocalFileSystem;
use serde_json::json;

use crate::error::{Error, Result};
use crate::remote::ObjectStoreRemote;

/// Builds a `Remote` backed by a plain directory tree.
pub fn new(root: &str) -> Result<ObjectStoreRemote> {
    if !root.starts_with('/') {
        return Err(Error::Config(format!("fs remote root must be absolute: {}", root)));
    }
    std::fs::create_dir_all(root).map_err(Error::from)?;
    let store = LocalFileSystem::new_with_prefix(root)
        .map_err(|e| Error::Config(format!("cannot use {} as remote root: {}", root, e)))?;
    Ok(ObjectStoreRemote::new("fs", json!({ "root": root }), "", Arc::new(store)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_relative_root() {
        assert!(new("relative/path").is_err());
    }
}
