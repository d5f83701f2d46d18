//! RPC procedure allow-list and call status.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Procedures a runner may call on the requester by default.
pub const DEFAULT_RPC_ALLOW_LIST: &[&str] = &[
    "helpers.httpRequestWithAuthentication",
    "helpers.requestWithAuthenticationPaginated",
    "helpers.getBinaryDataBuffer",
    "helpers.prepareBinaryData",
    "helpers.setBinaryDataBuffer",
    "helpers.binaryToString",
    "helpers.httpRequest",
    "helpers.copyBinaryFile",
    "helpers.createDeferredPromise",
    "helpers.getBinaryPath",
    "helpers.getBinaryMetadata",
    "helpers.getBinaryStream",
    "helpers.assertBinaryData",
    "helpers.checkProcessedAndRecord",
    "helpers.checkProcessedItemsAndRecord",
    "helpers.normalizeItems",
    "helpers.returnJsonArray",
    "logNodeOutput",
];

/// Fixed set of RPC procedure names the broker will relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcAllowList {
    names: BTreeSet<String>,
}

impl RpcAllowList {
    /// Create an allow-list from procedure names.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Check if a procedure is allowed.
    pub fn is_allowed(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    /// Fail with [`CoreError::RpcNotAllowed`] unless the procedure is allowed.
    pub fn check(&self, name: &str) -> Result<(), CoreError> {
        if self.is_allowed(name) {
            Ok(())
        } else {
            Err(CoreError::RpcNotAllowed(name.to_string()))
        }
    }

    /// Iterate over allowed names in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl Default for RpcAllowList {
    fn default() -> Self {
        Self::new(DEFAULT_RPC_ALLOW_LIST.iter().copied())
    }
}

/// Outcome of an RPC call as reported by the requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RpcStatus {
    Success,
    Error,
}
